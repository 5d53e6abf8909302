mod memory;
mod oauth2;

pub use memory::{MemoryRevocationStore, MemoryUserStore};
pub use oauth2::{HttpOAuthProvider, OAuth2Endpoints, map_profile};

use resonance_api::{AuthError, SecretStore};

pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, secret_ref: &str) -> Result<String, AuthError> {
        std::env::var(secret_ref)
            .map_err(|_| AuthError::Config(format!("missing secret env var {secret_ref}")))
    }
}

/// Fixed secrets, for tests and one-off CLI invocations.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    secrets: std::collections::BTreeMap<String, String>,
}

impl StaticSecretStore {
    #[must_use]
    pub fn with(mut self, secret_ref: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(secret_ref.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get(&self, secret_ref: &str) -> Result<String, AuthError> {
        self.secrets
            .get(secret_ref)
            .cloned()
            .ok_or_else(|| AuthError::Config(format!("missing secret {secret_ref}")))
    }
}
