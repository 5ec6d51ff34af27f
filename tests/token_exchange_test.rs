//! `HttpTokenExchange` against a mock token endpoint.
//!
//! The exchange uses reqwest's blocking client, so each call runs on
//! `spawn_blocking` while wiremock serves from the async runtime.

use serde_json::json;
use voicedeck::rpc::oauth::{ClientCredentials, HttpTokenExchange, TokenExchange, TokenPair};
use voicedeck::{Result, RpcError};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn run<F>(server: &MockServer, call: F) -> Result<TokenPair>
where
    F: FnOnce(&HttpTokenExchange, &ClientCredentials) -> Result<TokenPair> + Send + 'static,
{
    let url = format!("{}/api/oauth2/token", server.uri());
    tokio::task::spawn_blocking(move || {
        let exchange = HttpTokenExchange::with_url(url)?;
        let client = ClientCredentials::new("123", "secret")?;
        call(&exchange, &client)
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_code_exchange_posts_form_and_parses_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/oauth2/token"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=abc"))
        .and(body_string_contains("client_id=123"))
        .and(body_string_contains("client_secret=secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok1",
            "refresh_token": "ref1",
            "token_type": "Bearer",
            "expires_in": 604800,
            "scope": "rpc identify"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let pair = run(&server, |exchange, client| exchange.exchange_code(client, "abc"))
        .await
        .unwrap();

    assert_eq!(pair.access_token, "tok1");
    assert_eq!(pair.refresh_token.as_deref(), Some("ref1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refresh_uses_refresh_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=ref1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok2"})))
        .expect(1)
        .mount(&server)
        .await;

    let pair = run(&server, |exchange, client| exchange.refresh(client, "ref1"))
        .await
        .unwrap();

    assert_eq!(pair.access_token, "tok2");
    assert_eq!(pair.refresh_token, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_access_token_is_exchange_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid \"code\" in request."
        })))
        .mount(&server)
        .await;

    let result = run(&server, |exchange, client| exchange.exchange_code(client, "bad")).await;

    match result {
        Err(RpcError::OAuthExchangeFailed(reason)) => assert!(reason.contains("Invalid")),
        other => panic!("expected OAuthExchangeFailed, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_error_body_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({})))
        .mount(&server)
        .await;

    let result = run(&server, |exchange, client| exchange.refresh(client, "ref1")).await;

    match result {
        Err(RpcError::OAuthExchangeFailed(reason)) => assert!(reason.contains("401")),
        other => panic!("expected OAuthExchangeFailed, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_json_body_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&server)
        .await;

    let result = run(&server, |exchange, client| exchange.exchange_code(client, "abc")).await;
    assert!(matches!(result, Err(RpcError::Http(_))));
}
