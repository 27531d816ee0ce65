//! SSH front door: accepts connections, authenticates them through the device
//! flow and hands session channels to a [`SessionHandler`].

pub mod handler;
mod hangup;
pub mod keys;
pub mod mux;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::server::Config;
use russh::{Disconnect, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthGate, IdentityClient};
use crate::config::{GatewayConfig, MAX_CONNECTIONS_LIMIT};
use crate::error::{GatewayError, Result};

pub use handler::{ConnectionHandler, ConnectionState};
pub use keys::load_host_key;
pub use mux::{ChannelMux, ChannelOpen, Dispatch};
pub use session::{EchoShell, SessionHandler, SessionIo};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Connection supervisor.
pub struct Gateway {
    ssh_config: Arc<Config>,
    gate: Arc<AuthGate>,
    shell: Arc<dyn SessionHandler>,
    bind_addr: String,
    limiter: Arc<Semaphore>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        config: &GatewayConfig,
        host_key: PrivateKey,
        gate: Arc<AuthGate>,
        shell: Arc<dyn SessionHandler>,
    ) -> Self {
        let ssh_config = Config {
            methods: MethodSet::from(&[MethodKind::KeyboardInteractive][..]),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: Some(config.idle_timeout),
            keys: vec![host_key],
            ..Default::default()
        };
        Self {
            ssh_config: Arc::new(ssh_config),
            gate,
            shell,
            bind_addr: config.bind_addr(),
            limiter: Arc::new(Semaphore::new(
                config.max_connections.clamp(1, MAX_CONNECTIONS_LIMIT),
            )),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Load the host key and build the identity client from configuration.
    pub fn from_config(config: &GatewayConfig, shell: Arc<dyn SessionHandler>) -> Result<Self> {
        let host_key = load_host_key(&config.host_key_path)?;
        let client = IdentityClient::from_config(&config.provider)?;
        let gate = AuthGate::new(Arc::new(client), config.gate_settings());
        Ok(Self::new(config, host_key, Arc::new(gate), shell))
    }

    /// Stop accepting and cancel every live connection.
    pub fn shutdown(&self) {
        info!("Shutting down gateway");
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            GatewayError::Configuration(format!("Failed to bind {}: {}", self.bind_addr, e))
        })?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Listening for SSH connections");
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.limiter.clone().acquire_owned() => permit.map_err(|_| {
                    GatewayError::Session("connection limiter closed".to_string())
                })?,
            };
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                },
            };
            let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (stream, watch) = match hangup::with_watch(stream) {
                Ok(split) => split,
                Err(e) => {
                    warn!(conn_id, error = %e, "Failed to watch connection");
                    continue;
                }
            };
            let cancel = self.shutdown.child_token();
            tokio::spawn(hangup::watch_peer(watch, cancel.clone(), conn_id));
            let handler = ConnectionHandler::new(
                conn_id,
                Some(peer),
                self.gate.clone(),
                self.shell.clone(),
                cancel.clone(),
            );
            tokio::spawn(serve_connection(
                self.ssh_config.clone(),
                stream,
                handler,
                conn_id,
                cancel,
                permit,
            ));
        }
        info!("Gateway stopped accepting connections");
        Ok(())
    }
}

async fn serve_connection(
    config: Arc<Config>,
    stream: TcpStream,
    handler: ConnectionHandler,
    conn_id: u64,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    // Stops the hang-up watcher so its copy of the socket is closed too.
    let _watching = cancel.clone().drop_guard();
    let session = match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            warn!(conn_id, error = %e, "SSH handshake failed");
            return;
        }
    };
    let handle = session.handle();
    tokio::pin!(session);
    let result = tokio::select! {
        biased;
        result = &mut session => result,
        _ = cancel.cancelled() => {
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "closing connection".to_string(),
                    "en".to_string(),
                )
                .await;
            session.await
        }
    };
    match result {
        Ok(()) => debug!(conn_id, "SSH session ended"),
        Err(e) => warn!(conn_id, error = %e, "SSH session error"),
    }
}
