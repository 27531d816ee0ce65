use std::collections::HashMap;

/// Extension key under which the verified login is stored.
pub const LOGIN_EXTENSION: &str = "login";

/// A user identity confirmed by the identity provider's profile endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub login: String,
}

/// Connection-scoped attributes attached once authentication succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    pub fn for_identity(identity: &VerifiedIdentity) -> Self {
        let mut extensions = HashMap::new();
        extensions.insert(LOGIN_EXTENSION.to_string(), identity.login.clone());
        Self { extensions }
    }

    pub fn login(&self) -> Option<&str> {
        self.extensions.get(LOGIN_EXTENSION).map(String::as_str)
    }

    /// Rebuild the identity carried by these permissions.
    pub fn identity(&self) -> Option<VerifiedIdentity> {
        self.login().map(|login| VerifiedIdentity {
            login: login.to_string(),
        })
    }
}
