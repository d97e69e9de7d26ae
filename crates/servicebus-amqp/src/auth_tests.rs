//! Tests for token types and providers.

use super::*;
use chrono::TimeZone;

#[test]
fn test_token_type_wire_names() {
    assert_eq!(TokenType::Jwt.as_str(), "jwt");
    assert_eq!(TokenType::Sas.as_str(), "servicebus.windows.net:sastoken");
}

#[test]
fn test_token_expiry_is_unix_seconds() {
    let expires_at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let token = Token::new(TokenType::Jwt, "secret", expires_at);

    assert_eq!(token.expiry, expires_at.timestamp().to_string());
}

#[test]
fn test_debug_output_redacts_token() {
    let token = Token::new(TokenType::Sas, "super-secret-signature", Utc::now());
    let debug = format!("{:?}", token);

    assert!(!debug.contains("super-secret-signature"));
    assert!(debug.contains("<redacted>"));
}

#[tokio::test]
async fn test_static_provider_returns_same_token_for_any_audience() {
    let token = Token::new(TokenType::Jwt, "abc", Utc::now());
    let provider = StaticTokenProvider::new(token.clone());

    let first = provider.get_token("amqp://ns/a").await.unwrap();
    let second = provider.get_token("amqp://ns/b").await.unwrap();

    assert_eq!(first, token);
    assert_eq!(second, token);
}
