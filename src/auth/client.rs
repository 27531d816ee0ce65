use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;

use crate::auth::device_code::{AccessToken, DeviceAuthorization};
use crate::auth::error::AuthError;
use crate::auth::identity::VerifiedIdentity;
use crate::config::ProviderConfig;

pub const DEFAULT_DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
pub const DEFAULT_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
pub const DEFAULT_PROFILE_URL: &str = "https://api.github.com/user";
pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

const PROFILE_ACCEPT: &str = "application/vnd.github.v3+json";
const CLIENT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the three device-authorization exchanges.
///
/// Stateless apart from its configuration, so one instance is shared by every
/// connection.
///
/// # Example
/// ```no_run
/// use device_gate::auth::IdentityClient;
///
/// # async fn example() -> Result<(), device_gate::auth::AuthError> {
/// let client = IdentityClient::new("Iv1.0123456789abcdef");
/// let authorization = client.request_device_authorization().await?;
/// println!("{}", authorization.instructions());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct IdentityClient {
    client: reqwest::Client,
    client_id: String,
    scope: Option<String>,
    device_code_url: String,
    token_url: String,
    profile_url: String,
}

impl IdentityClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: client_id.into(),
            scope: None,
            device_code_url: DEFAULT_DEVICE_CODE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            profile_url: DEFAULT_PROFILE_URL.to_string(),
        }
    }

    /// Build a client from provider settings, with the request timeout applied.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let mut identity = Self::new(config.client_id.clone())
            .with_client(client)
            .with_device_code_url(config.device_code_url.clone())
            .with_token_url(config.token_url.clone())
            .with_profile_url(config.profile_url.clone());
        identity.scope = config.scope.clone();
        Ok(identity)
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_device_code_url(mut self, url: impl Into<String>) -> Self {
        self.device_code_url = url.into();
        self
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn with_profile_url(mut self, url: impl Into<String>) -> Self {
        self.profile_url = url.into();
        self
    }

    /// Ask the provider for a device code and the user code to display.
    pub async fn request_device_authorization(&self) -> Result<DeviceAuthorization, AuthError> {
        let mut form = vec![("client_id", self.client_id.as_str())];
        if let Some(scope) = self.scope.as_deref() {
            form.push(("scope", scope));
        }
        let resp = self
            .client
            .post(&self.device_code_url)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .form(&form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AuthError::Protocol(format!(
                "Device code request failed with status {}",
                resp.status()
            )));
        }
        let values = parse_form(&resp.text().await?)?;
        if let Some(error) = values.get("error") {
            return Err(AuthError::Protocol(format!(
                "Device code request rejected: {error}"
            )));
        }
        Ok(DeviceAuthorization {
            device_code: required(&values, "device_code")?.to_string(),
            user_code: required(&values, "user_code")?.to_string(),
            verification_uri: required(&values, "verification_uri")?.to_string(),
            expires_in: seconds(&values, "expires_in")?,
            interval: seconds(&values, "interval")?,
        })
    }

    /// Poll the token endpoint once.
    ///
    /// Returns [`AuthError::AuthorizationPending`] or [`AuthError::SlowDown`] while
    /// the user has not yet approved the request; spacing the calls is up to the
    /// caller.
    pub async fn poll_for_token(
        &self,
        authorization: &DeviceAuthorization,
    ) -> Result<AccessToken, AuthError> {
        let resp = self
            .client
            .post(&self.token_url)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("device_code", authorization.device_code.as_str()),
                ("grant_type", DEVICE_CODE_GRANT_TYPE),
            ])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        // OAuth servers report pending/denied with 400, so the body is read first.
        let values = match parse_form(&body) {
            Ok(values) => values,
            Err(_) if !status.is_success() => {
                return Err(AuthError::Protocol(format!(
                    "Device token request failed with status {status}"
                )))
            }
            Err(e) => return Err(e),
        };
        match values.get("error").map(String::as_str) {
            Some("authorization_pending") => return Err(AuthError::AuthorizationPending),
            Some("slow_down") => return Err(AuthError::SlowDown),
            Some("access_denied") => return Err(AuthError::AccessDenied),
            Some("expired_token") => return Err(AuthError::Expired),
            Some(other) => {
                return Err(AuthError::Protocol(format!("Device token error: {other}")))
            }
            None if !status.is_success() => {
                return Err(AuthError::Protocol(format!(
                    "Device token request failed with status {status}"
                )))
            }
            None => {}
        }
        let access_token = values.get("access_token").cloned().unwrap_or_default();
        if access_token.is_empty() {
            return Err(AuthError::NoAccessToken);
        }
        Ok(AccessToken {
            access_token,
            token_type: values.get("token_type").cloned().unwrap_or_default(),
            scope: values.get("scope").cloned().unwrap_or_default(),
        })
    }

    /// Exchange an access token for the account's login name.
    pub async fn resolve_identity(&self, access_token: &str) -> Result<VerifiedIdentity, AuthError> {
        let resp = self
            .client
            .get(&self.profile_url)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(ACCEPT, PROFILE_ACCEPT)
            .header(AUTHORIZATION, format!("Bearer {access_token}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AuthError::Protocol(format!(
                "Profile request failed with status {}",
                resp.status()
            )));
        }
        let payload: ProfileResponse = serde_json::from_slice(&resp.bytes().await?)?;
        if payload.login.is_empty() {
            return Err(AuthError::Protocol("Profile login is empty".to_string()));
        }
        Ok(VerifiedIdentity {
            login: payload.login,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    login: String,
}

/// Parse an `application/x-www-form-urlencoded` body. The first value of a
/// repeated key wins.
fn parse_form(body: &str) -> Result<HashMap<String, String>, AuthError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(AuthError::Protocol("Empty form body".to_string()));
    }
    for pair in body.split('&').filter(|pair| !pair.is_empty()) {
        if pair.contains(';') {
            return Err(AuthError::Protocol(
                "Invalid semicolon separator in form body".to_string(),
            ));
        }
        if !pair.contains('=') {
            return Err(AuthError::Protocol(format!("Malformed form pair `{pair}`")));
        }
        check_escapes(pair)?;
    }
    let mut values = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        values
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    Ok(values)
}

fn check_escapes(pair: &str) -> Result<(), AuthError> {
    let bytes = pair.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return Err(AuthError::Protocol(format!(
                    "Invalid percent escape in `{pair}`"
                )));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn required<'a>(values: &'a HashMap<String, String>, key: &str) -> Result<&'a str, AuthError> {
    match values.get(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(AuthError::Protocol(format!("Missing `{key}` in response"))),
    }
}

fn seconds(values: &HashMap<String, String>, key: &str) -> Result<Duration, AuthError> {
    let raw = required(values, key)?;
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| AuthError::Protocol(format!("`{key}` is not an integer: {raw:?}")))
}
