use std::time::Duration;

use thiserror::Error;

use crate::error::GatewayError;

/// Errors produced while authenticating a connection against the identity provider.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Authorization pending")]
    AuthorizationPending,
    #[error("Slow down")]
    SlowDown,
    #[error("Access denied")]
    AccessDenied,
    #[error("Device code expired")]
    Expired,
    #[error("no access token")]
    NoAccessToken,
    #[error("Timed out after {}ms waiting for {what}", .after.as_millis())]
    Timeout { what: &'static str, after: Duration },
    #[error("Authentication cancelled")]
    Cancelled,
}

impl AuthError {
    /// Whether the token endpoint asked us to keep polling.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::AuthorizationPending | Self::SlowDown)
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::Protocol(error.to_string());
        }
        Self::Network(error.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(error: serde_json::Error) -> Self {
        Self::Protocol(error.to_string())
    }
}

impl From<AuthError> for GatewayError {
    fn from(error: AuthError) -> Self {
        GatewayError::Authentication(error.to_string())
    }
}
