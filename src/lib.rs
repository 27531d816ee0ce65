//! device-gate: an SSH login gateway that authenticates users through the
//! OAuth device-authorization grant.
//!
//! A connecting client is shown a verification URL and a short code. Once the
//! user approves the code in a browser, the gateway resolves their login from
//! the identity provider's profile endpoint and hands each session channel to a
//! pluggable [`server::SessionHandler`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use device_gate::config::GatewayConfig;
//! use device_gate::server::{EchoShell, Gateway};
//!
//! # async fn example() -> device_gate::error::Result<()> {
//! let config = GatewayConfig::from_env()?;
//! let gateway = Gateway::from_config(&config, Arc::new(EchoShell))?;
//! gateway.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod server;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
