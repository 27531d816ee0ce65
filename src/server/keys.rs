use std::path::Path;

use russh::keys::PrivateKey;
use tracing::info;

use crate::error::{GatewayError, Result};

/// Load the server's private host key.
///
/// A missing or unparsable key is fatal at startup; no key is generated.
pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    if !path.exists() {
        return Err(GatewayError::HostKey(format!(
            "Host key not found at {}",
            path.display()
        )));
    }
    let key = russh::keys::load_secret_key(path, None).map_err(|e| {
        GatewayError::HostKey(format!(
            "Failed to load host key from {}: {}",
            path.display(),
            e
        ))
    })?;
    info!(path = %path.display(), algorithm = %key.algorithm(), "Loaded host key");
    Ok(key)
}
