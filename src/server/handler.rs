//! The per-connection russh handler.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::{Auth, Handler, Msg, Response, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::mux::{ChannelMux, ChannelOpen, Dispatch, SESSION_CHANNEL, SHELL_REQUEST};
use super::session::{run_session, SessionHandler};
use crate::auth::{AuthError, AuthGate, Challenge, Permissions};
use crate::error::GatewayError;

/// Lifecycle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Authenticating,
    Authenticated,
    Failed,
    Closed,
}

pub struct ConnectionHandler {
    id: u64,
    peer: Option<SocketAddr>,
    gate: Arc<AuthGate>,
    shell: Arc<dyn SessionHandler>,
    state: ConnectionState,
    pending: Option<Challenge>,
    /// Dropped once the prompt is answered; otherwise the connection is cancelled
    /// when the prompt times out.
    prompt_timer: Option<DropGuard>,
    permissions: Option<Permissions>,
    mux: ChannelMux<ChannelId>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        id: u64,
        peer: Option<SocketAddr>,
        gate: Arc<AuthGate>,
        shell: Arc<dyn SessionHandler>,
        cancel: CancellationToken,
    ) -> Self {
        debug!(conn_id = id, peer = ?peer, "Connection accepted");
        Self {
            id,
            peer,
            gate,
            shell,
            state: ConnectionState::Accepted,
            pending: None,
            prompt_timer: None,
            permissions: None,
            mux: ChannelMux::new(),
            channels: HashMap::new(),
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(conn_id = self.id, from = ?self.state, to = ?next, "Connection state changed");
        self.state = next;
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    fn fail(&mut self) -> Auth {
        self.pending = None;
        self.prompt_timer = None;
        self.transition(ConnectionState::Failed);
        Self::reject()
    }

    async fn begin_login(&mut self) -> Auth {
        self.transition(ConnectionState::Authenticating);
        let challenge = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AuthError::Cancelled),
            result = self.gate.challenge() => result,
        };
        match challenge {
            Ok(challenge) => {
                let prompt = &challenge.prompt;
                let items: Vec<(Cow<'static, str>, bool)> = prompt
                    .items
                    .iter()
                    .map(|item| (Cow::Owned(item.text.clone()), item.echo))
                    .collect();
                let auth = Auth::Partial {
                    name: Cow::Owned(prompt.title.clone()),
                    instructions: Cow::Owned(prompt.instructions.clone()),
                    prompts: Cow::Owned(items),
                };
                self.pending = Some(challenge);
                self.prompt_timer = Some(self.start_prompt_timer());
                auth
            }
            Err(e) => {
                warn!(conn_id = self.id, error = %e, "Device authorization failed");
                self.fail()
            }
        }
    }

    /// Cancel the connection if the prompt is still unanswered after the
    /// gate's prompt timeout.
    fn start_prompt_timer(&self) -> DropGuard {
        let answered = CancellationToken::new();
        let connection = self.cancel.clone();
        let timeout = self.gate.settings().prompt_timeout;
        let conn_id = self.id;
        let watch = answered.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch.cancelled() => {}
                _ = connection.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    debug!(conn_id, "Login prompt timed out");
                    connection.cancel();
                }
            }
        });
        answered.drop_guard()
    }

    async fn finish_login(&mut self) -> Auth {
        self.prompt_timer = None;
        let Some(challenge) = self.pending.take() else {
            debug!(conn_id = self.id, "Prompt response without a pending challenge");
            return self.fail();
        };
        match self.gate.complete(&challenge, &self.cancel).await {
            Ok(permissions) => {
                info!(
                    conn_id = self.id,
                    peer = ?self.peer,
                    login = permissions.login().unwrap_or_default(),
                    "Connection authenticated"
                );
                self.permissions = Some(permissions);
                self.transition(ConnectionState::Authenticated);
                Auth::Accept
            }
            Err(e) => {
                warn!(conn_id = self.id, error = %e, "Authentication failed");
                self.fail()
            }
        }
    }

    fn open_channel(&mut self, channel: Channel<Msg>, channel_type: &str) -> bool {
        if self.state != ConnectionState::Authenticated {
            debug!(conn_id = self.id, channel_type, "Channel open before authentication");
            return false;
        }
        let id = channel.id();
        match self.mux.open(id, channel_type) {
            ChannelOpen::Accepted => {
                debug!(conn_id = self.id, channel = ?id, "Session channel opened");
                self.channels.insert(id, channel);
                true
            }
            ChannelOpen::Rejected => {
                debug!(conn_id = self.id, channel_type, "Unknown channel type rejected");
                false
            }
        }
    }

    fn ignore_request(&self, channel_id: ChannelId, request_type: &str) {
        debug!(conn_id = self.id, channel = ?channel_id, request_type, "Channel request ignored");
    }
}

impl Handler for ConnectionHandler {
    type Error = GatewayError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(conn_id = self.id, user, "Rejecting none authentication");
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::KeyboardInteractive][..])),
            partial_success: false,
        })
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        if self.state == ConnectionState::Failed {
            debug!(conn_id = self.id, user, "Authentication retry after failure rejected");
            return Ok(Self::reject());
        }
        match response {
            None => {
                debug!(conn_id = self.id, user, "Keyboard-interactive authentication started");
                Ok(self.begin_login().await)
            }
            Some(_) => Ok(self.finish_login().await),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel(channel, SESSION_CHANNEL))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(conn_id = self.id, host_to_connect, port_to_connect, "Port forwarding refused");
        Ok(self.open_channel(channel, "direct-tcpip"))
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.mux.request(&channel_id, SHELL_REQUEST) != Dispatch::StartSession {
            debug!(conn_id = self.id, channel = ?channel_id, "Repeated shell request ignored");
            return Ok(());
        }
        let identity = self
            .permissions
            .as_ref()
            .and_then(Permissions::identity)
            .ok_or_else(|| GatewayError::Session("shell requested without a login".to_string()))?;
        let channel = self.channels.remove(&channel_id).ok_or_else(|| {
            GatewayError::Session(format!("no open channel {channel_id:?}"))
        })?;
        session.channel_success(channel_id)?;

        info!(conn_id = self.id, channel = ?channel_id, login = %identity.login, "Starting session");
        tokio::spawn(run_session(
            self.shell.clone(),
            identity,
            channel,
            session.handle(),
            self.id,
            self.cancel.child_token(),
        ));
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.ignore_request(channel_id, "exec");
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(conn_id = self.id, subsystem = name, "Subsystem requested");
        self.ignore_request(channel_id, "subsystem");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(conn_id = self.id, term, col_width, row_height, "PTY requested");
        self.ignore_request(channel_id, "pty-req");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.mux.close(&channel_id) {
            debug!(conn_id = self.id, channel = ?channel_id, "Channel closed");
        }
        self.channels.remove(&channel_id);
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.transition(ConnectionState::Closed);
        debug!(
            conn_id = self.id,
            open_channels = self.mux.open_channels(),
            "Connection closed"
        );
    }
}
