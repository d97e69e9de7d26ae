//! Credential seam used by claims negotiation.
//!
//! Token acquisition (OAuth, shared access signatures) lives outside the link
//! layer; it is reached only through [`TokenProvider`].

use crate::error::ServiceBusError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;

/// Kind of bearer token carried in a `put-token` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// OAuth JSON web token
    Jwt,
    /// Shared access signature token
    Sas,
}

impl TokenType {
    /// Value of the `type` application property
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jwt => "jwt",
            Self::Sas => "servicebus.windows.net:sastoken",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bearer token for an audience
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub token_type: TokenType,
    pub token: String,
    /// Expiry as seconds since the Unix epoch, sent verbatim as `expiration`
    pub expiry: String,
}

impl Token {
    pub fn new(token_type: TokenType, token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token_type,
            token: token.into(),
            expiry: expires_at.timestamp().to_string(),
        }
    }
}

// Never print the token itself.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("token_type", &self.token_type)
            .field("token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Source of bearer tokens for claims negotiation
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Get a token authorizing access to `audience`
    async fn get_token(&self, audience: &str) -> Result<Token, ServiceBusError>;
}

/// Provider that hands out one pre-issued token for every audience.
///
/// Intended for development and tests.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Token,
}

impl StaticTokenProvider {
    pub fn new(token: Token) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, _audience: &str) -> Result<Token, ServiceBusError> {
        Ok(self.token.clone())
    }
}
