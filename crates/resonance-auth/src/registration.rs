//! Local account creation.

use std::sync::Arc;

use serde::Deserialize;

use resonance_api::{
    DEFAULT_AUTHORITY, Identity, IssuedVia, ProviderKind, UserRecord, UserStore,
};

use crate::error::from_store;
use crate::password::Argon2Hasher;
use crate::{Error, Result, guard};

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

pub struct Registrar {
    users: Arc<dyn UserStore>,
    hasher: Argon2Hasher,
}

impl Registrar {
    pub fn new(users: Arc<dyn UserStore>, hasher: Argon2Hasher) -> Self {
        Self { users, hasher }
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<Identity> {
        let email = request.email.trim();
        let username = request.username.trim();
        guard::registration(email, username, &request.password)?;

        if self.users.find_user_by_email(email).await.map_err(from_store)?.is_some() {
            return Err(Error::Conflict("email already in use".to_string()));
        }
        if self.users.find_user_by_username(username).await.map_err(from_store)?.is_some() {
            return Err(Error::Conflict("username already in use".to_string()));
        }

        let password_hash = self.hasher.hash_async(&request.password).await?;
        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: Some(password_hash),
            authorities: [DEFAULT_AUTHORITY.to_string()].into(),
            provider: ProviderKind::Local,
            provider_subject: None,
            locked: false,
        };
        let identity = Identity::new(
            record.id.clone(),
            record.authorities.iter().cloned(),
            IssuedVia::Local,
        );
        // The store re-checks uniqueness; a concurrent registration surfaces as Conflict here.
        self.users.insert_user(record).await.map_err(from_store)?;
        tracing::info!(subject = %identity.subject_id(), "registered local account");
        Ok(identity)
    }

    /// Create an account with explicit authorities, skipping the duplicate pre-check.
    /// Used for bootstrap accounts.
    pub async fn provision(
        &self,
        email: &str,
        username: &str,
        password: &str,
        authorities: &[&str],
    ) -> Result<Identity> {
        guard::registration(email, username, password)?;
        let password_hash = self.hasher.hash_async(password).await?;
        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: Some(password_hash),
            authorities: authorities.iter().map(|a| (*a).to_string()).collect(),
            provider: ProviderKind::Local,
            provider_subject: None,
            locked: false,
        };
        let identity = Identity::new(
            record.id.clone(),
            record.authorities.iter().cloned(),
            IssuedVia::Local,
        );
        self.users.insert_user(record).await.map_err(from_store)?;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::password::fast_hasher;

    #[derive(Default)]
    struct Users(Mutex<Vec<UserRecord>>);

    #[async_trait]
    impl UserStore for Users {
        async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
            Ok(self.0.lock().unwrap().iter().find(|u| u.username == username).cloned())
        }
        async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
            Ok(self.0.lock().unwrap().iter().find(|u| u.email == email).cloned())
        }
        async fn find_user_by_provider(&self, _: ProviderKind, _: &str) -> Result<Option<UserRecord>> {
            Ok(None)
        }
        async fn insert_user(&self, user: UserRecord) -> Result<()> {
            self.0.lock().unwrap().push(user);
            Ok(())
        }
        async fn link_provider(&self, _: &str, _: ProviderKind, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn request(email: &str, username: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.into(),
            username: username.into(),
            password: "long-enough".into(),
        }
    }

    #[tokio::test]
    async fn registers_with_default_authority_and_hashed_password() {
        let users = Arc::new(Users::default());
        let registrar = Registrar::new(users.clone(), fast_hasher());
        let id = registrar.register(&request("ada@example.com", "ada")).await.unwrap();
        assert!(id.has_authority(DEFAULT_AUTHORITY));

        let stored = users.find_user_by_username("ada").await.unwrap().unwrap();
        let hash = stored.password_hash.unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(fast_hasher().verify("long-enough", &hash));
    }

    #[tokio::test]
    async fn duplicate_email_or_username_conflicts() {
        let registrar = Registrar::new(Arc::new(Users::default()), fast_hasher());
        registrar.register(&request("ada@example.com", "ada")).await.unwrap();

        let err = registrar.register(&request("ada@example.com", "other")).await.unwrap_err();
        assert_eq!(err, Error::Conflict("email already in use".into()));
        let err = registrar.register(&request("new@example.com", "ada")).await.unwrap_err();
        assert_eq!(err, Error::Conflict("username already in use".into()));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_storage() {
        let users = Arc::new(Users::default());
        let registrar = Registrar::new(users.clone(), fast_hasher());
        let err = registrar.register(&request("not-an-email", "ada")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(users.0.lock().unwrap().is_empty());
    }
}
