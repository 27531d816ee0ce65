use async_trait::async_trait;

use super::client::IdentityClient;
use super::device_code::{AccessToken, DeviceAuthorization};
use super::error::AuthError;
use super::identity::VerifiedIdentity;

/// The identity-provider calls the authentication gate depends on.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn request_device_authorization(&self) -> Result<DeviceAuthorization, AuthError>;

    async fn poll_for_token(
        &self,
        authorization: &DeviceAuthorization,
    ) -> Result<AccessToken, AuthError>;

    async fn resolve_identity(&self, access_token: &str) -> Result<VerifiedIdentity, AuthError>;
}

#[async_trait]
impl IdentityProvider for IdentityClient {
    async fn request_device_authorization(&self) -> Result<DeviceAuthorization, AuthError> {
        IdentityClient::request_device_authorization(self).await
    }

    async fn poll_for_token(
        &self,
        authorization: &DeviceAuthorization,
    ) -> Result<AccessToken, AuthError> {
        IdentityClient::poll_for_token(self, authorization).await
    }

    async fn resolve_identity(&self, access_token: &str) -> Result<VerifiedIdentity, AuthError> {
        IdentityClient::resolve_identity(self, access_token).await
    }
}
