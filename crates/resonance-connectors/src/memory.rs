//! In-process implementations of the persistence collaborators.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use resonance_api::{AuthError, ProviderKind, RevocationRecord, RevocationStore, UserRecord, UserStore};
use resonance_auth::codec::unix_now;

/// Users keyed by id. Username and email are unique; email comparison ignores case.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<BTreeMap<String, UserRecord>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize, AuthError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, AuthError> {
        Ok(self.read()?.is_empty())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, UserRecord>>, AuthError> {
        self.users
            .read()
            .map_err(|_| AuthError::Unavailable("user store poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, UserRecord>>, AuthError> {
        self.users
            .write()
            .map_err(|_| AuthError::Unavailable("user store poisoned".to_string()))
    }

    fn find(&self, pred: impl Fn(&UserRecord) -> bool) -> Result<Option<UserRecord>, AuthError> {
        Ok(self.read()?.values().find(|u| pred(u)).cloned())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, AuthError> {
        self.find(|u| u.username == username)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, AuthError> {
        self.find(|u| u.email.eq_ignore_ascii_case(email))
    }

    async fn find_user_by_provider(
        &self,
        provider: ProviderKind,
        subject: &str,
    ) -> Result<Option<UserRecord>, AuthError> {
        self.find(|u| u.provider == provider && u.provider_subject.as_deref() == Some(subject))
    }

    async fn insert_user(&self, user: UserRecord) -> Result<(), AuthError> {
        let mut users = self.write()?;
        if users.contains_key(&user.id) {
            return Err(AuthError::Conflict(format!("user id {} already exists", user.id)));
        }
        if users.values().any(|u| u.username == user.username) {
            return Err(AuthError::Conflict("username already in use".to_string()));
        }
        if users.values().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(AuthError::Conflict("email already in use".to_string()));
        }
        users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn link_provider(
        &self,
        user_id: &str,
        provider: ProviderKind,
        subject: &str,
    ) -> Result<(), AuthError> {
        let mut users = self.write()?;
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| AuthError::Unavailable(format!("user {user_id} vanished while linking")))?;
        user.provider = provider;
        user.provider_subject = Some(subject.to_string());
        Ok(())
    }
}

/// Revoked token ids and revoked families, with their natural expiry.
#[derive(Debug, Default)]
pub struct MemoryRevocationStore {
    tokens: DashMap<String, RevocationRecord>,
    families: DashMap<String, u64>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len() + self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn find_revocation(&self, token_id: &str) -> Result<Option<RevocationRecord>, AuthError> {
        Ok(self.tokens.get(token_id).map(|r| r.value().clone()))
    }

    async fn insert_revocation(&self, token_id: &str, expires_at: u64) -> Result<bool, AuthError> {
        // The entry holds the shard lock, so check-and-insert cannot interleave.
        match self.tokens.entry(token_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(RevocationRecord {
                    token_id: token_id.to_string(),
                    revoked_at: unix_now(),
                    expires_at,
                });
                Ok(true)
            }
        }
    }

    async fn revoke_family(&self, family_id: &str, expires_at: u64) -> Result<(), AuthError> {
        self.families
            .entry(family_id.to_string())
            .and_modify(|until| *until = (*until).max(expires_at))
            .or_insert(expires_at);
        Ok(())
    }

    async fn is_family_revoked(&self, family_id: &str) -> Result<bool, AuthError> {
        Ok(self.families.contains_key(family_id))
    }

    async fn prune_expired(&self, now: u64) -> Result<usize, AuthError> {
        let before = self.len();
        self.tokens.retain(|_, r| r.expires_at > now);
        self.families.retain(|_, until| *until > now);
        Ok(before.saturating_sub(self.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;

    fn user(id: &str, username: &str, email: &str) -> UserRecord {
        UserRecord {
            id: id.into(),
            username: username.into(),
            email: email.into(),
            password_hash: None,
            authorities: BTreeSet::new(),
            provider: ProviderKind::Local,
            provider_subject: None,
            locked: false,
        }
    }

    #[tokio::test]
    async fn duplicates_conflict() {
        let store = MemoryUserStore::new();
        store.insert_user(user("1", "ada", "ada@example.com")).await.unwrap();
        assert!(matches!(
            store.insert_user(user("2", "ada", "x@example.com")).await,
            Err(AuthError::Conflict(_))
        ));
        assert!(matches!(
            store.insert_user(user("3", "bob", "ADA@example.com")).await,
            Err(AuthError::Conflict(_))
        ));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn provider_link_is_searchable() {
        let store = MemoryUserStore::new();
        store.insert_user(user("1", "ada", "ada@example.com")).await.unwrap();
        store.link_provider("1", ProviderKind::Spotify, "sp-1").await.unwrap();
        let found = store
            .find_user_by_provider(ProviderKind::Spotify, "sp-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "1");
        assert!(store.link_provider("nope", ProviderKind::Google, "g").await.is_err());
    }

    #[tokio::test]
    async fn second_insert_of_same_id_reports_false() {
        let store = MemoryRevocationStore::new();
        assert!(store.insert_revocation("t1", 100).await.unwrap());
        assert!(!store.insert_revocation("t1", 100).await.unwrap());
        assert_eq!(store.find_revocation("t1").await.unwrap().unwrap().expires_at, 100);
    }

    #[tokio::test]
    async fn revocation_is_stamped_with_the_codec_clock() {
        let store = MemoryRevocationStore::new();
        let before = unix_now();
        store.insert_revocation("t1", before + 60).await.unwrap();
        let record = store.find_revocation("t1").await.unwrap().unwrap();
        assert!(record.revoked_at >= before);
        assert!(record.revoked_at <= unix_now());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_have_one_winner() {
        let store = Arc::new(MemoryRevocationStore::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.insert_revocation("shared", 100).await.unwrap()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn prune_removes_expired_tokens_and_families() {
        let store = MemoryRevocationStore::new();
        store.insert_revocation("old", 10).await.unwrap();
        store.insert_revocation("new", 1_000).await.unwrap();
        store.revoke_family("fam-old", 10).await.unwrap();
        store.revoke_family("fam-new", 1_000).await.unwrap();

        assert_eq!(store.prune_expired(10).await.unwrap(), 2);
        assert!(store.find_revocation("old").await.unwrap().is_none());
        assert!(store.find_revocation("new").await.unwrap().is_some());
        assert!(!store.is_family_revoked("fam-old").await.unwrap());
        assert!(store.is_family_revoked("fam-new").await.unwrap());
    }

    #[tokio::test]
    async fn family_revocation_keeps_the_later_expiry() {
        let store = MemoryRevocationStore::new();
        store.revoke_family("f", 500).await.unwrap();
        store.revoke_family("f", 100).await.unwrap();
        assert_eq!(store.prune_expired(200).await.unwrap(), 0);
        assert!(store.is_family_revoked("f").await.unwrap());
    }
}
