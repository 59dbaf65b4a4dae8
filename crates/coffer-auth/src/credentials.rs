//! Access key to secret key lookup

use coffer_core::config::CredentialEntry;
use coffer_core::{Error, Result};
use rand::Rng;
use std::collections::HashMap;

/// Resolves the secret key for an access key id.
///
/// The verifier only consumes this; credential storage lives elsewhere.
pub trait CredentialProvider: Send + Sync {
    /// Returns [`Error::InvalidAccessKeyId`] for unknown keys
    fn get_secret_key(&self, access_key: &str) -> Result<String>;
}

/// In-memory provider built from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    credentials: HashMap<String, String>,
}

impl StaticCredentialProvider {
    pub fn new(credentials: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            credentials: credentials.into_iter().collect(),
        }
    }

    pub fn from_entries(entries: &[CredentialEntry]) -> Self {
        Self::new(
            entries
                .iter()
                .map(|e| (e.access_key.clone(), e.secret_key.clone())),
        )
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get_secret_key(&self, access_key: &str) -> Result<String> {
        self.credentials
            .get(access_key)
            .cloned()
            .ok_or(Error::InvalidAccessKeyId)
    }
}

/// Generate new access key and secret key pair
pub fn generate_credentials() -> (String, String) {
    let mut rng = rand::rng();

    // Access key: CFR + 17 uppercase alphanumerics
    const KEY_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let access_key: String = format!(
        "CFR{}",
        (0..17)
            .map(|_| KEY_CHARSET[rng.random_range(0..KEY_CHARSET.len())] as char)
            .collect::<String>()
    );

    const SECRET_CHARSET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let secret_key: String = (0..40)
        .map(|_| SECRET_CHARSET[rng.random_range(0..SECRET_CHARSET.len())] as char)
        .collect();

    (access_key, secret_key)
}
