//! Configuration (layered: defaults < environment / `.env` < CLI flags).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::auth::client::DEFAULT_PROFILE_URL;
use crate::auth::gate::{GateSettings, DEFAULT_PROMPT_TITLE};
use crate::error::{GatewayError, Result};

pub const DEFAULT_LISTEN_ADDR: &str = ":2222";
pub const DEFAULT_HOST_KEY_PATH: &str = "id_rsa";
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
/// Largest connection cap the connection limiter can hold.
pub const MAX_CONNECTIONS_LIMIT: usize = Semaphore::MAX_PERMITS;

/// Identity-provider endpoints and credentials.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub device_code_url: String,
    pub token_url: String,
    pub profile_url: String,
    pub client_id: String,
    pub scope: Option<String>,
    pub http_timeout: Duration,
}

/// Everything the gateway needs to start.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub host_key_path: PathBuf,
    pub max_connections: usize,
    pub prompt_title: String,
    /// How long a login prompt may stay unanswered before the connection is dropped.
    pub prompt_timeout: Duration,
    /// Connections with no traffic for this long are dropped by the transport.
    pub idle_timeout: Duration,
    pub provider: ProviderConfig,
}

impl GatewayConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            value(key).ok_or_else(|| GatewayError::Configuration(format!("{key} is not set")))
        };

        let provider = ProviderConfig {
            device_code_url: required("OIDC_CODE_ENDPOINT")?,
            token_url: required("OIDC_TOKEN_ENDPOINT")?,
            profile_url: value("OIDC_PROFILE_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_PROFILE_URL.to_string()),
            client_id: required("OIDC_CLIENT_ID")?,
            scope: value("OIDC_SCOPE"),
            http_timeout: Duration::from_secs(parse_or(
                value("HTTP_TIMEOUT_SECS"),
                "HTTP_TIMEOUT_SECS",
                10,
            )?),
        };

        let max_connections = parse_or(
            value("MAX_CONNECTIONS"),
            "MAX_CONNECTIONS",
            DEFAULT_MAX_CONNECTIONS,
        )?;
        if max_connections == 0 {
            return Err(GatewayError::Configuration(
                "MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        if max_connections > MAX_CONNECTIONS_LIMIT {
            return Err(GatewayError::Configuration(format!(
                "MAX_CONNECTIONS must be at most {MAX_CONNECTIONS_LIMIT}"
            )));
        }

        Ok(Self {
            listen_addr: value("LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            host_key_path: value("HOST_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOST_KEY_PATH)),
            max_connections,
            prompt_title: value("LOGIN_PROMPT_TITLE")
                .unwrap_or_else(|| DEFAULT_PROMPT_TITLE.to_string()),
            prompt_timeout: Duration::from_secs(parse_or(
                value("PROMPT_TIMEOUT_SECS"),
                "PROMPT_TIMEOUT_SECS",
                300,
            )?),
            idle_timeout: Duration::from_secs(parse_or(
                value("IDLE_TIMEOUT_SECS"),
                "IDLE_TIMEOUT_SECS",
                900,
            )?),
            provider,
        })
    }

    /// Address to bind; a bare `:port` means every interface.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            prompt_title: self.prompt_title.clone(),
            prompt_timeout: self.prompt_timeout,
            request_timeout: self.provider.http_timeout,
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            GatewayError::Configuration(format!("{key} must be a non-negative integer, got {raw:?}"))
        }),
    }
}
