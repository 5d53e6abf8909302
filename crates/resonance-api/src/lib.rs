use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type SubjectId = String;
pub type TokenId = String;
pub type FamilyId = String;

/// Authority granted to every account created through registration or first OAuth2 login.
pub const DEFAULT_AUTHORITY: &str = "ROLE_USER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssuedVia {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "oauth2")]
    OAuth2,
}

impl IssuedVia {
    pub fn as_str(self) -> &'static str {
        match self {
            IssuedVia::Local => "local",
            IssuedVia::OAuth2 => "oauth2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical authenticated principal.
///
/// Fields are private so an identity cannot be altered after a verifier produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    subject_id: SubjectId,
    authorities: BTreeSet<String>,
    issued_via: IssuedVia,
}

impl Identity {
    pub fn new<I, S>(subject_id: impl Into<SubjectId>, authorities: I, issued_via: IssuedVia) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subject_id: subject_id.into(),
            authorities: authorities.into_iter().map(Into::into).collect(),
            issued_via,
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn authorities(&self) -> &BTreeSet<String> {
        &self.authorities
    }

    pub fn issued_via(&self) -> IssuedVia {
        self.issued_via
    }

    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.contains(authority)
    }
}

/// Claims carried inside a signed token. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(rename = "sub")]
    pub subject: SubjectId,
    #[serde(rename = "auth", default)]
    pub authorities: BTreeSet<String>,
    #[serde(rename = "iat")]
    pub issued_at: u64,
    #[serde(rename = "exp")]
    pub expires_at: u64,
    #[serde(rename = "jti")]
    pub token_id: TokenId,
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    #[serde(rename = "via")]
    pub issued_via: IssuedVia,
    /// Shared by every token descending from the same login.
    #[serde(rename = "fam")]
    pub family_id: FamilyId,
}

impl TokenClaims {
    pub fn lifetime_seconds(&self) -> u64 {
        self.expires_at.saturating_sub(self.issued_at)
    }

    pub fn identity(&self) -> Identity {
        Identity {
            subject_id: self.subject.clone(),
            authorities: self.authorities.clone(),
            issued_via: self.issued_via,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_expires_in: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub token_id: TokenId,
    pub revoked_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Google,
    Spotify,
    Oidc,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Google => "google",
            ProviderKind::Spotify => "spotify",
            ProviderKind::Oidc => "oidc",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ProviderKind::Local),
            "google" => Ok(ProviderKind::Google),
            "spotify" => Ok(ProviderKind::Spotify),
            "oidc" => Ok(ProviderKind::Oidc),
            other => Err(AuthError::Config(format!("unknown oauth2 provider {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: SubjectId,
    pub username: String,
    pub email: String,
    /// Argon2 PHC string. `None` for accounts that only ever logged in through a provider.
    pub password_hash: Option<String>,
    pub authorities: BTreeSet<String>,
    pub provider: ProviderKind,
    pub provider_subject: Option<String>,
    #[serde(default)]
    pub locked: bool,
}

/// What an OAuth2 provider vouches for after a successful code exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAssertion {
    pub issuer: String,
    pub audience: Vec<String>,
    pub subject: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub claims: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked")]
    AccountLocked,
    #[error("oauth2 provider rejected the exchange: {0}")]
    ProviderRejected(String),
    #[error("oauth2 provider unreachable: {0}")]
    ProviderUnreachable(String),
    #[error("untrusted issuer: {0}")]
    UntrustedIssuer(String),
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("token revoked")]
    TokenRevoked,
    #[error("wrong token type: expected {expected}, found {found}")]
    WrongTokenType { expected: TokenType, found: TokenType },
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("token encoding error: {0}")]
    Encoding(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// The only shape of an authentication failure that may leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicRejection {
    Unauthorized,
    BadRequest,
    Conflict,
    ServiceUnavailable,
}

impl PublicRejection {
    pub fn status_code(self) -> u16 {
        match self {
            PublicRejection::Unauthorized => 401,
            PublicRejection::BadRequest => 400,
            PublicRejection::Conflict => 409,
            PublicRejection::ServiceUnavailable => 503,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            PublicRejection::Unauthorized => "Unauthorized",
            PublicRejection::BadRequest => "Bad Request",
            PublicRejection::Conflict => "Conflict",
            PublicRejection::ServiceUnavailable => "Service Unavailable",
        }
    }
}

impl AuthError {
    /// Short stable label, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::AccountLocked => "account_locked",
            AuthError::ProviderRejected(_) => "provider_rejected",
            AuthError::ProviderUnreachable(_) => "provider_unreachable",
            AuthError::UntrustedIssuer(_) => "untrusted_issuer",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::Expired => "expired",
            AuthError::Malformed(_) => "malformed",
            AuthError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            AuthError::TokenRevoked => "token_revoked",
            AuthError::WrongTokenType { .. } => "wrong_token_type",
            AuthError::Unavailable(_) => "unavailable",
            AuthError::Validation(_) => "validation",
            AuthError::Conflict(_) => "conflict",
            AuthError::Encoding(_) => "encoding",
            AuthError::Config(_) => "config",
            AuthError::Internal(_) => "internal",
        }
    }

    /// Retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthError::ProviderUnreachable(_) | AuthError::Unavailable(_)
        )
    }

    pub fn public_rejection(&self) -> PublicRejection {
        match self {
            AuthError::ProviderUnreachable(_) | AuthError::Unavailable(_) => {
                PublicRejection::ServiceUnavailable
            }
            AuthError::Validation(_) | AuthError::Malformed(_) => PublicRejection::BadRequest,
            AuthError::Conflict(_) => PublicRejection::Conflict,
            AuthError::Encoding(_) | AuthError::Config(_) | AuthError::Internal(_) => {
                PublicRejection::ServiceUnavailable
            }
            _ => PublicRejection::Unauthorized,
        }
    }
}

pub trait SecretStore: Send + Sync {
    fn get(&self, secret_ref: &str) -> Result<String, AuthError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, AuthError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, AuthError>;
    async fn find_user_by_provider(
        &self,
        provider: ProviderKind,
        subject: &str,
    ) -> Result<Option<UserRecord>, AuthError>;
    /// Fails with `Conflict` when the username or email is taken.
    async fn insert_user(&self, user: UserRecord) -> Result<(), AuthError>;
    async fn link_provider(
        &self,
        user_id: &str,
        provider: ProviderKind,
        subject: &str,
    ) -> Result<(), AuthError>;
}

#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn find_revocation(&self, token_id: &str) -> Result<Option<RevocationRecord>, AuthError>;
    /// Returns `false` when the id was already revoked. Check and insert are one atomic step.
    async fn insert_revocation(&self, token_id: &str, expires_at: u64) -> Result<bool, AuthError>;
    async fn revoke_family(&self, family_id: &str, expires_at: u64) -> Result<(), AuthError>;
    async fn is_family_revoked(&self, family_id: &str) -> Result<bool, AuthError>;
    /// Drops records whose natural expiry is at or before `now`. Returns how many went.
    async fn prune_expired(&self, now: u64) -> Result<usize, AuthError>;
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;
    async fn exchange_code(&self, code: &str) -> Result<ProviderAssertion, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_use_compact_wire_names() {
        let claims = TokenClaims {
            subject: "u1".into(),
            authorities: BTreeSet::from(["READ".to_string()]),
            issued_at: 10,
            expires_at: 20,
            token_id: "t1".into(),
            token_type: TokenType::Refresh,
            issued_via: IssuedVia::OAuth2,
            family_id: "f1".into(),
        };
        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["sub"], "u1");
        assert_eq!(value["typ"], "refresh");
        assert_eq!(value["via"], "oauth2");
        assert_eq!(value["auth"][0], "READ");
        assert_eq!(claims.lifetime_seconds(), 10);
    }

    #[test]
    fn transient_errors_are_retryable_and_opaque() {
        let err = AuthError::ProviderUnreachable("timeout".into());
        assert!(err.is_transient());
        assert_eq!(err.public_rejection(), PublicRejection::ServiceUnavailable);

        assert!(!AuthError::ProviderRejected("denied".into()).is_transient());
        assert_eq!(
            AuthError::TokenRevoked.public_rejection(),
            PublicRejection::Unauthorized
        );
        assert_eq!(
            AuthError::InvalidCredentials.public_rejection(),
            AuthError::AccountLocked.public_rejection()
        );
    }

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!("Google".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert!("github".parse::<ProviderKind>().is_err());
    }
}
