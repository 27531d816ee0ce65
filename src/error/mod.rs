//! Error types for the gateway.

use thiserror::Error;

/// Primary error type for gateway operations.
///
/// Also the error type of the per-connection SSH handler, so it must absorb
/// [`russh::Error`].
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Host key error: {0}")]
    HostKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Session error: {0}")]
    Session(String),
}

impl GatewayError {
    /// Whether the process cannot start because of this error.
    pub fn is_startup_error(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::HostKey(_))
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, GatewayError>;
