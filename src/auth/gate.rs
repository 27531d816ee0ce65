//! Device-flow authentication for a single SSH connection.
//!
//! Keyboard-interactive authentication arrives in two rounds: the first asks the
//! server for prompts, the second carries the user's answers. [`AuthGate::challenge`]
//! serves the first round and [`AuthGate::complete`] the second.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::device_code::{AccessToken, DeviceAuthorization};
use super::error::AuthError;
use super::identity::Permissions;
use super::provider::IdentityProvider;
use crate::util::timeout::with_timeout;

pub const DEFAULT_PROMPT_TITLE: &str = "Log in to GitHub";
pub const ACKNOWLEDGE_PROMPT: &str = "Press enter to continue...";

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Tunables for [`AuthGate`].
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub prompt_title: String,
    /// How long the user may take to acknowledge the verification prompt.
    pub prompt_timeout: Duration,
    /// Upper bound for each identity-provider request.
    pub request_timeout: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            prompt_title: DEFAULT_PROMPT_TITLE.to_string(),
            prompt_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptItem {
    pub text: String,
    pub echo: bool,
}

/// What the client is shown while the user approves the login elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub title: String,
    pub instructions: String,
    pub items: Vec<PromptItem>,
}

/// A started authentication attempt, waiting for the user to acknowledge the prompt.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub authorization: DeviceAuthorization,
    pub prompt: Prompt,
    issued_at: Instant,
}

impl Challenge {
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// When the device code stops being redeemable, or `None` when the
    /// advertised lifetime does not fit in the clock.
    pub fn deadline(&self) -> Option<Instant> {
        self.issued_at.checked_add(self.authorization.expires_in)
    }
}

/// Turns a device-authorization round trip into connection permissions.
pub struct AuthGate {
    provider: Arc<dyn IdentityProvider>,
    settings: GateSettings,
}

impl AuthGate {
    pub fn new(provider: Arc<dyn IdentityProvider>, settings: GateSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    /// Request a device code and build the prompt that tells the user where to
    /// enter it.
    pub async fn challenge(&self) -> Result<Challenge, AuthError> {
        let authorization = with_timeout(
            "device code request",
            self.settings.request_timeout,
            self.provider.request_device_authorization(),
        )
        .await?;
        debug!(
            user_code = %authorization.user_code,
            expires_in_secs = authorization.expires_in.as_secs(),
            interval_secs = authorization.interval.as_secs(),
            "Issued device code"
        );
        let prompt = Prompt {
            title: self.settings.prompt_title.clone(),
            instructions: authorization.instructions(),
            items: vec![PromptItem {
                text: ACKNOWLEDGE_PROMPT.to_string(),
                echo: true,
            }],
        };
        Ok(Challenge {
            authorization,
            prompt,
            issued_at: Instant::now(),
        })
    }

    /// Poll until the user approves, then resolve who they are.
    pub async fn complete(
        &self,
        challenge: &Challenge,
        cancel: &CancellationToken,
    ) -> Result<Permissions, AuthError> {
        if challenge.issued_at.elapsed() >= self.settings.prompt_timeout {
            return Err(AuthError::Timeout {
                what: "prompt acknowledgment",
                after: self.settings.prompt_timeout,
            });
        }
        let token = self.poll_until_authorized(challenge, cancel).await?;
        let lookup = with_timeout(
            "profile request",
            self.settings.request_timeout,
            self.provider.resolve_identity(&token.access_token),
        );
        let identity = tokio::select! {
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            result = lookup => result?,
        };
        info!(login = %identity.login, "User logged in");
        Ok(Permissions::for_identity(&identity))
    }

    async fn poll_until_authorized(
        &self,
        challenge: &Challenge,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, AuthError> {
        let deadline = challenge.deadline();
        let mut interval = challenge.authorization.interval.max(MIN_POLL_INTERVAL);
        let mut attempts: u32 = 0;
        loop {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(AuthError::Expired);
            }
            attempts += 1;
            let poll = with_timeout(
                "token request",
                self.settings.request_timeout,
                self.provider.poll_for_token(&challenge.authorization),
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                result = poll => result,
            };
            match result {
                Ok(token) => {
                    debug!(attempts, "Device code authorized");
                    return Ok(token);
                }
                Err(AuthError::SlowDown) => {
                    interval = interval.saturating_add(SLOW_DOWN_STEP);
                    debug!(attempts, interval_secs = interval.as_secs(), "Provider asked to slow down");
                }
                Err(AuthError::AuthorizationPending) => {
                    debug!(attempts, "Authorization pending");
                }
                Err(e) => return Err(e),
            }
            // A wake time past the clock's range can never come before the deadline.
            let wake = match (Instant::now().checked_add(interval), deadline) {
                (Some(wake), Some(deadline)) if wake >= deadline => return Err(AuthError::Expired),
                (Some(wake), _) => wake,
                (None, _) => return Err(AuthError::Expired),
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
