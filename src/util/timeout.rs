//! Timeout helper.

use std::future::Future;
use std::time::Duration;

use crate::auth::AuthError;

/// Wrap an identity-provider call with a deadline.
pub async fn with_timeout<T>(
    what: &'static str,
    duration: Duration,
    future: impl Future<Output = Result<T, AuthError>>,
) -> Result<T, AuthError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(AuthError::Timeout {
            what,
            after: duration,
        }),
    }
}
