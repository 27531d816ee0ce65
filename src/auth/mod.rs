//! OAuth device-authorization flow and the SSH authentication gate built on it.

pub mod client;
pub mod device_code;
pub mod error;
pub mod gate;
pub mod identity;
pub mod provider;

pub use client::IdentityClient;
pub use device_code::{AccessToken, DeviceAuthorization};
pub use error::AuthError;
pub use gate::{AuthGate, Challenge, GateSettings, Prompt, PromptItem};
pub use identity::{Permissions, VerifiedIdentity, LOGIN_EXTENSION};
pub use provider::IdentityProvider;
