use std::fmt;
use std::time::Duration;

/// Device and user codes issued by the identity provider for one login attempt.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use device_gate::auth::DeviceAuthorization;
///
/// let authorization = DeviceAuthorization {
///     device_code: "3584d83530557fdd1f46af8289938c8ef79f9dc5".to_string(),
///     user_code: "WDJB-MJHT".to_string(),
///     verification_uri: "https://github.com/login/device".to_string(),
///     expires_in: Duration::from_secs(900),
///     interval: Duration::from_secs(5),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: Duration,
    pub interval: Duration,
}

impl DeviceAuthorization {
    /// The line shown to the connecting user.
    pub fn instructions(&self) -> String {
        format!(
            "Go to {} and enter the code {}",
            self.verification_uri, self.user_code
        )
    }
}

/// Bearer credential returned by the token endpoint.
///
/// Only lives long enough to look up the user's profile.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub scope: String,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"..")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}
