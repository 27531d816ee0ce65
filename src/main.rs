//! device-gate binary entry point.

use std::sync::Arc;

use device_gate::cli::Cli;
use device_gate::config::GatewayConfig;
use device_gate::error::Result;
use device_gate::server::{EchoShell, Gateway};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse_args();

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "Gateway failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.apply(GatewayConfig::from_env()?);
    let gateway = Gateway::from_config(&config, Arc::new(EchoShell))?;

    tokio::select! {
        result = gateway.run() => result,
        _ = tokio::signal::ctrl_c() => {
            gateway.shutdown();
            Ok(())
        }
    }
}
