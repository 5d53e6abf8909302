//! Access/refresh pair issuance and refresh-token rotation.
//!
//! Every login starts a token *family*. Rotating a refresh token revokes its id and
//! issues a new pair in the same family. Presenting an already-rotated refresh token
//! revokes the whole family, so every descendant refresh token stops working too.

use std::sync::Arc;
use std::time::Duration;

use resonance_api::{Identity, RevocationStore, TokenClaims, TokenPair, TokenType};

use crate::codec::{self, unix_now};
use crate::error::from_store;
use crate::keys::TokenKeys;
use crate::{Error, Result};

/// Default lifetime of an access token.
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(15 * 60);
/// Default lifetime of a refresh token.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Upper bound for either lifetime.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLifetimes {
    pub access: Duration,
    pub refresh: Duration,
}

impl TokenLifetimes {
    pub fn new(access: Duration, refresh: Duration) -> Result<Self> {
        if access.as_secs() == 0 {
            return Err(Error::Config("access token lifetime must be at least one second".to_string()));
        }
        if refresh > MAX_TOKEN_TTL {
            return Err(Error::Config(format!(
                "refresh token lifetime ({}s) exceeds the maximum of {}s",
                refresh.as_secs(),
                MAX_TOKEN_TTL.as_secs()
            )));
        }
        if refresh <= access {
            return Err(Error::Config(format!(
                "refresh token lifetime ({}s) must exceed access token lifetime ({}s)",
                refresh.as_secs(),
                access.as_secs()
            )));
        }
        Ok(Self { access, refresh })
    }
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            access: DEFAULT_ACCESS_TTL,
            refresh: DEFAULT_REFRESH_TTL,
        }
    }
}

pub struct SessionIssuer {
    keys: Arc<TokenKeys>,
    revocations: Arc<dyn RevocationStore>,
    lifetimes: TokenLifetimes,
}

impl SessionIssuer {
    pub fn new(
        keys: Arc<TokenKeys>,
        revocations: Arc<dyn RevocationStore>,
        lifetimes: TokenLifetimes,
    ) -> Self {
        Self {
            keys,
            revocations,
            lifetimes,
        }
    }

    pub fn lifetimes(&self) -> TokenLifetimes {
        self.lifetimes
    }

    /// Start a new family for a freshly verified identity.
    pub fn issue(&self, identity: &Identity) -> Result<TokenPair> {
        let family = uuid::Uuid::new_v4().to_string();
        let pair = self.issue_in_family(identity, &family, unix_now())?;
        tracing::info!(
            subject = %identity.subject_id(),
            via = identity.issued_via().as_str(),
            family = %family,
            "issued token pair"
        );
        Ok(pair)
    }

    /// Exchange a refresh token for a new pair. The presented token is spent.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = codec::verify(refresh_token, self.keys.verification())?;
        if claims.token_type != TokenType::Refresh {
            return Err(Error::WrongTokenType {
                expected: TokenType::Refresh,
                found: claims.token_type,
            });
        }

        if self
            .revocations
            .is_family_revoked(&claims.family_id)
            .await
            .map_err(from_store)?
        {
            tracing::debug!(family = %claims.family_id, "refresh attempted on revoked family");
            return Err(Error::TokenRevoked);
        }

        let now = unix_now();
        let first_use = self
            .revocations
            .insert_revocation(&claims.token_id, claims.expires_at)
            .await
            .map_err(from_store)?;
        if !first_use {
            tracing::warn!(
                subject = %claims.subject,
                family = %claims.family_id,
                token_id = %claims.token_id,
                "refresh token replayed, revoking family"
            );
            self.revoke_family(&claims.family_id, now).await?;
            return Err(Error::TokenRevoked);
        }

        let pair = self.issue_in_family(&claims.identity(), &claims.family_id, now)?;
        tracing::debug!(subject = %claims.subject, family = %claims.family_id, "rotated refresh token");
        Ok(pair)
    }

    /// Logout: end the family the presented token belongs to.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        let claims = codec::verify(token, self.keys.verification())?;
        let now = unix_now();
        self.revocations
            .insert_revocation(&claims.token_id, claims.expires_at)
            .await
            .map_err(from_store)?;
        self.revoke_family(&claims.family_id, now).await?;
        tracing::info!(subject = %claims.subject, family = %claims.family_id, "session revoked");
        Ok(())
    }

    /// Drop revocation records whose tokens could no longer verify anyway.
    pub async fn prune(&self, now: u64) -> Result<usize> {
        let removed = self
            .revocations
            .prune_expired(now)
            .await
            .map_err(from_store)?;
        if removed > 0 {
            tracing::debug!(removed, "pruned revocation records");
        }
        Ok(removed)
    }

    async fn revoke_family(&self, family: &str, now: u64) -> Result<()> {
        // No descendant refresh token can outlive this.
        let until = now.saturating_add(self.lifetimes.refresh.as_secs());
        self.revocations
            .revoke_family(family, until)
            .await
            .map_err(from_store)
    }

    fn issue_in_family(&self, identity: &Identity, family: &str, now: u64) -> Result<TokenPair> {
        let access = Self::claims(identity, family, TokenType::Access, now, self.lifetimes.access)?;
        let refresh = Self::claims(identity, family, TokenType::Refresh, now, self.lifetimes.refresh)?;

        Ok(TokenPair {
            access_token: codec::sign(&access, self.keys.signing())?,
            refresh_token: codec::sign(&refresh, self.keys.signing())?,
            token_type: "Bearer".to_string(),
            expires_in: access.lifetime_seconds(),
            refresh_expires_in: refresh.lifetime_seconds(),
        })
    }

    fn claims(
        identity: &Identity,
        family: &str,
        token_type: TokenType,
        now: u64,
        ttl: Duration,
    ) -> Result<TokenClaims> {
        let expires_at = now
            .checked_add(ttl.as_secs())
            .ok_or_else(|| Error::Encoding(format!("{token_type} token expiry overflows")))?;
        Ok(TokenClaims {
            subject: identity.subject_id().to_string(),
            authorities: identity.authorities().clone(),
            issued_at: now,
            expires_at,
            token_id: uuid::Uuid::new_v4().to_string(),
            token_type,
            issued_via: identity.issued_via(),
            family_id: family.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use resonance_api::{IssuedVia, RevocationRecord};

    use super::*;
    use crate::keys::TokenAlgorithm;

    #[derive(Default)]
    struct Revocations {
        tokens: Mutex<HashMap<String, RevocationRecord>>,
        families: Mutex<HashMap<String, u64>>,
    }

    #[async_trait]
    impl RevocationStore for Revocations {
        async fn find_revocation(&self, token_id: &str) -> Result<Option<RevocationRecord>> {
            Ok(self.tokens.lock().unwrap().get(token_id).cloned())
        }
        async fn insert_revocation(&self, token_id: &str, expires_at: u64) -> Result<bool> {
            let mut tokens = self.tokens.lock().unwrap();
            if tokens.contains_key(token_id) {
                return Ok(false);
            }
            tokens.insert(
                token_id.to_string(),
                RevocationRecord {
                    token_id: token_id.to_string(),
                    revoked_at: unix_now(),
                    expires_at,
                },
            );
            Ok(true)
        }
        async fn revoke_family(&self, family_id: &str, expires_at: u64) -> Result<()> {
            self.families.lock().unwrap().insert(family_id.to_string(), expires_at);
            Ok(())
        }
        async fn is_family_revoked(&self, family_id: &str) -> Result<bool> {
            Ok(self.families.lock().unwrap().contains_key(family_id))
        }
        async fn prune_expired(&self, now: u64) -> Result<usize> {
            let mut tokens = self.tokens.lock().unwrap();
            let before = tokens.len();
            tokens.retain(|_, r| r.expires_at > now);
            Ok(before - tokens.len())
        }
    }

    fn issuer() -> (SessionIssuer, Arc<TokenKeys>) {
        let keys = Arc::new(TokenKeys::hmac(TokenAlgorithm::Hs256, &[42u8; 32]).unwrap());
        let issuer = SessionIssuer::new(
            keys.clone(),
            Arc::new(Revocations::default()),
            TokenLifetimes::new(Duration::from_secs(900), Duration::from_secs(86_400)).unwrap(),
        );
        (issuer, keys)
    }

    fn ada() -> Identity {
        Identity::new("u1", ["READ"], IssuedVia::Local)
    }

    #[test]
    fn issued_access_token_carries_identity_and_ttl() {
        let (issuer, keys) = issuer();
        let pair = issuer.issue(&ada()).unwrap();
        let access = codec::verify(&pair.access_token, keys.verification()).unwrap();
        assert_eq!(access.subject, "u1");
        assert_eq!(access.token_type, TokenType::Access);
        assert_eq!(access.expires_at - access.issued_at, 900);
        assert!(access.authorities.contains("READ"));
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 900);
        assert_eq!(pair.refresh_expires_in, 86_400);

        let refresh = codec::verify(&pair.refresh_token, keys.verification()).unwrap();
        assert_eq!(refresh.token_type, TokenType::Refresh);
        assert_ne!(refresh.token_id, access.token_id);
        assert_eq!(refresh.family_id, access.family_id);
    }

    #[test]
    fn every_login_gets_its_own_family() {
        let (issuer, keys) = issuer();
        let a = issuer.issue(&ada()).unwrap();
        let b = issuer.issue(&ada()).unwrap();
        let fam = |t: &str| codec::verify(t, keys.verification()).unwrap().family_id;
        assert_ne!(fam(&a.refresh_token), fam(&b.refresh_token));
    }

    #[tokio::test]
    async fn refresh_rotates_within_the_family() {
        let (issuer, keys) = issuer();
        let first = issuer.issue(&ada()).unwrap();
        let second = issuer.refresh(&first.refresh_token).await.unwrap();

        let old = codec::verify(&first.refresh_token, keys.verification()).unwrap();
        let new = codec::verify(&second.refresh_token, keys.verification()).unwrap();
        assert_ne!(old.token_id, new.token_id);
        assert_eq!(old.family_id, new.family_id);
        assert_eq!(new.identity(), ada());
    }

    #[tokio::test]
    async fn replayed_refresh_token_is_revoked() {
        let (issuer, _) = issuer();
        let pair = issuer.issue(&ada()).unwrap();
        issuer.refresh(&pair.refresh_token).await.unwrap();
        assert_eq!(
            issuer.refresh(&pair.refresh_token).await.unwrap_err(),
            Error::TokenRevoked
        );
    }

    #[tokio::test]
    async fn replay_kills_descendants() {
        let (issuer, _) = issuer();
        let t1 = issuer.issue(&ada()).unwrap();
        let t2 = issuer.refresh(&t1.refresh_token).await.unwrap();

        assert_eq!(issuer.refresh(&t1.refresh_token).await.unwrap_err(), Error::TokenRevoked);
        assert_eq!(issuer.refresh(&t2.refresh_token).await.unwrap_err(), Error::TokenRevoked);

        // Other families are untouched.
        let other = issuer.issue(&ada()).unwrap();
        assert!(issuer.refresh(&other.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn access_token_cannot_refresh() {
        let (issuer, _) = issuer();
        let pair = issuer.issue(&ada()).unwrap();
        assert_eq!(
            issuer.refresh(&pair.access_token).await.unwrap_err(),
            Error::WrongTokenType {
                expected: TokenType::Refresh,
                found: TokenType::Access
            }
        );
    }

    #[tokio::test]
    async fn concurrent_refreshes_yield_exactly_one_pair() {
        let (issuer, _) = issuer();
        let issuer = Arc::new(issuer);
        let pair = issuer.issue(&ada()).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let issuer = issuer.clone();
            let token = pair.refresh_token.clone();
            tasks.push(tokio::spawn(async move { issuer.refresh(&token).await }));
        }
        let mut ok = 0;
        let mut ids = HashSet::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(p) => {
                    ok += 1;
                    ids.insert(p.refresh_token);
                }
                Err(e) => assert_eq!(e, Error::TokenRevoked),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn logout_revokes_the_family() {
        let (issuer, _) = issuer();
        let pair = issuer.issue(&ada()).unwrap();
        issuer.revoke(&pair.access_token).await.unwrap();
        assert_eq!(issuer.refresh(&pair.refresh_token).await.unwrap_err(), Error::TokenRevoked);
    }

    #[tokio::test]
    async fn prune_drops_only_expired_records() {
        let (issuer, _) = issuer();
        let pair = issuer.issue(&ada()).unwrap();
        issuer.refresh(&pair.refresh_token).await.unwrap();
        assert_eq!(issuer.prune(unix_now()).await.unwrap(), 0);
        assert_eq!(issuer.prune(unix_now() + 86_401).await.unwrap(), 1);
    }

    #[test]
    fn lifetimes_must_be_ordered() {
        assert!(TokenLifetimes::new(Duration::from_secs(60), Duration::from_secs(60)).is_err());
        assert!(TokenLifetimes::new(Duration::ZERO, Duration::from_secs(60)).is_err());
        assert!(TokenLifetimes::new(Duration::from_secs(60), Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn absurd_lifetimes_are_refused() {
        let century = Duration::from_secs(100 * 365 * 24 * 60 * 60);
        let err = TokenLifetimes::new(Duration::from_secs(60), century).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(TokenLifetimes::new(Duration::from_secs(60), Duration::MAX).is_err());
        assert!(TokenLifetimes::new(Duration::from_secs(60), MAX_TOKEN_TTL).is_ok());
    }

    #[test]
    fn overflowing_expiry_is_an_error_not_a_panic() {
        let (_, keys) = issuer();
        let lifetimes = TokenLifetimes {
            access: Duration::from_secs(u64::MAX - 1),
            refresh: Duration::MAX,
        };
        let issuer = SessionIssuer::new(keys, Arc::new(Revocations::default()), lifetimes);
        assert!(matches!(issuer.issue(&ada()), Err(Error::Encoding(_))));
    }
}
