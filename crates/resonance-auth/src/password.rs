//! Argon2id password hashing.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::{Error, Result};

/// Cost parameters for argon2id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

/// Hashes and verifies PHC-format argon2id strings.
#[derive(Clone)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl Argon2Hasher {
    pub fn new(cost: HashCost) -> Result<Self> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| Error::Config(format!("invalid argon2 parameters: {e}")))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))
    }

    /// `false` for a wrong password and for an unparseable stored hash alike.
    pub fn verify(&self, password: &str, phc: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(phc) else {
            tracing::warn!("stored password hash is not a valid PHC string");
            return false;
        };
        self.argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// [`Self::hash`] on the blocking pool, so a slow cost never stalls a runtime worker.
    pub async fn hash_async(&self, password: &str) -> Result<String> {
        let hasher = self.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| Error::Internal(format!("password hashing task failed: {e}")))?
    }

    pub async fn verify_async(&self, password: &str, phc: &str) -> Result<bool> {
        let hasher = self.clone();
        let (password, phc) = (password.to_string(), phc.to_string());
        tokio::task::spawn_blocking(move || hasher.verify(&password, &phc))
            .await
            .map_err(|e| Error::Internal(format!("password verification task failed: {e}")))
    }
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }
}

impl std::fmt::Debug for Argon2Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Argon2Hasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn fast_hasher() -> Argon2Hasher {
    Argon2Hasher::new(HashCost {
        memory_kib: 256,
        iterations: 1,
        parallelism: 1,
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn hash_verifies_only_the_original_password() {
        let hasher = fast_hasher();
        let phc = hasher.hash("correct horse").unwrap();
        assert!(phc.starts_with("$argon2id$"));
        assert!(hasher.verify("correct horse", &phc));
        assert!(!hasher.verify("correct horsf", &phc));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let hasher = fast_hasher();
        assert_ne!(hasher.hash("pw").unwrap(), hasher.hash("pw").unwrap());
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!fast_hasher().verify("pw", "not-a-phc-string"));
    }

    #[tokio::test]
    async fn async_variants_agree_with_the_sync_ones() {
        let hasher = fast_hasher();
        let phc = hasher.hash_async("correct horse").await.unwrap();
        assert!(hasher.verify("correct horse", &phc));
        assert!(hasher.verify_async("correct horse", &phc).await.unwrap());
        assert!(!hasher.verify_async("correct horsf", &phc).await.unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn hashing_leaves_the_runtime_free_for_other_tasks() {
        let hasher = Argon2Hasher::new(HashCost {
            memory_kib: 8 * 1024,
            iterations: 2,
            parallelism: 1,
        })
        .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });

        let phc = hasher.hash_async("pw").await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(hasher.verify_async("pw", &phc).await.unwrap());
    }

    #[test]
    fn zero_memory_cost_is_a_config_error() {
        let err = Argon2Hasher::new(HashCost {
            memory_kib: 0,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
