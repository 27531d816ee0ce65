//! Command-line flags for the gateway binary.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{GatewayConfig, MAX_CONNECTIONS_LIMIT};

/// SSH login gateway authenticated through the OAuth device flow
#[derive(Parser, Debug, Default)]
#[command(name = "device-gate", version, about)]
pub struct Cli {
    /// Listen address (overrides LISTEN_ADDR, e.g. ":2222" or "127.0.0.1:2222")
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Path to the server's private host key (overrides HOST_KEY_PATH)
    #[arg(long)]
    pub host_key: Option<PathBuf>,

    /// Maximum concurrent connections (overrides MAX_CONNECTIONS)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_CONNECTIONS_LIMIT as u64))]
    pub max_connections: Option<u64>,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Layer the flags over configuration loaded from the environment.
    pub fn apply(self, mut config: GatewayConfig) -> GatewayConfig {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(host_key) = self.host_key {
            config.host_key_path = host_key;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = usize::try_from(max_connections)
                .map_or(MAX_CONNECTIONS_LIMIT, |n| n.min(MAX_CONNECTIONS_LIMIT));
        }
        config
    }
}
