//! Credential verification: local passwords and OAuth2 delegated login.
//!
//! Both paths end in an [`Identity`]. Local failures never tell an unknown account
//! apart from a wrong password, and OAuth2 assertions are only trusted when they come
//! from the configured issuer for our client id.

use std::sync::Arc;
use std::time::Duration;

use resonance_api::{
    DEFAULT_AUTHORITY, Identity, IssuedVia, OAuthProvider, ProviderAssertion, UserRecord,
    UserStore,
};

use crate::error::from_store;
use crate::password::Argon2Hasher;
use crate::{Error, Result, guard};

const DUMMY_PASSWORD: &str = "resonance-dummy-password";

/// What a provider assertion has to match before it is believed.
#[derive(Debug, Clone)]
pub struct ProviderTrust {
    pub issuer: String,
    pub client_id: String,
    pub timeout: Duration,
}

impl ProviderTrust {
    pub fn new(issuer: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn check(&self, assertion: &ProviderAssertion) -> Result<()> {
        let expected = self.issuer.trim_end_matches('/');
        let actual = assertion.issuer.trim_end_matches('/');
        if expected != actual {
            return Err(Error::UntrustedIssuer(format!(
                "expected issuer {expected}, got {actual}"
            )));
        }
        if !assertion.audience.iter().any(|aud| aud == &self.client_id) {
            return Err(Error::UntrustedIssuer(format!(
                "assertion audience does not include client {}",
                self.client_id
            )));
        }
        if assertion.subject.trim().is_empty() {
            return Err(Error::ProviderRejected("assertion has no subject".to_string()));
        }
        Ok(())
    }
}

struct OAuth2Binding {
    provider: Arc<dyn OAuthProvider>,
    trust: ProviderTrust,
}

pub struct CredentialVerifier {
    users: Arc<dyn UserStore>,
    hasher: Argon2Hasher,
    dummy_hash: String,
    oauth2: Option<OAuth2Binding>,
}

impl CredentialVerifier {
    pub fn new(users: Arc<dyn UserStore>, hasher: Argon2Hasher) -> Result<Self> {
        let dummy_hash = hasher.hash(DUMMY_PASSWORD)?;
        Ok(Self {
            users,
            hasher,
            dummy_hash,
            oauth2: None,
        })
    }

    #[must_use]
    pub fn with_oauth2(mut self, provider: Arc<dyn OAuthProvider>, trust: ProviderTrust) -> Self {
        self.oauth2 = Some(OAuth2Binding { provider, trust });
        self
    }

    pub fn oauth2_enabled(&self) -> bool {
        self.oauth2.is_some()
    }

    /// Check a username (or email) and password against the user store.
    pub async fn verify_local(&self, login: &str, password: &str) -> Result<Identity> {
        guard::login_fields(login, password)?;
        let login = login.trim();

        let user = if login.contains('@') {
            self.users.find_user_by_email(login).await
        } else {
            self.users.find_user_by_username(login).await
        }
        .map_err(from_store)?;

        let Some((user, stored)) = user
            .as_ref()
            .and_then(|u| u.password_hash.as_deref().map(|h| (u, h)))
        else {
            // Same work as a real check so response time does not reveal the account.
            let _ = self.hasher.verify_async(password, &self.dummy_hash).await?;
            tracing::debug!(kind = "invalid_credentials", "local login for unknown or passwordless account");
            return Err(Error::InvalidCredentials);
        };

        if !self.hasher.verify_async(password, stored).await? {
            tracing::debug!(subject = %user.id, kind = "invalid_credentials", "local login with wrong password");
            return Err(Error::InvalidCredentials);
        }
        if user.locked {
            tracing::info!(subject = %user.id, "login refused for locked account");
            return Err(Error::AccountLocked);
        }

        Ok(Identity::new(
            user.id.clone(),
            user.authorities.iter().cloned(),
            IssuedVia::Local,
        ))
    }

    /// Exchange an authorization code and map the provider's subject to a local user.
    pub async fn verify_oauth2(&self, code: &str) -> Result<Identity> {
        guard::authorization_code(code)?;
        let binding = self
            .oauth2
            .as_ref()
            .ok_or_else(|| Error::Config("oauth2 login is not configured".to_string()))?;

        let assertion =
            match tokio::time::timeout(binding.trust.timeout, binding.provider.exchange_code(code))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!(
                        provider = binding.provider.kind().as_str(),
                        timeout = ?binding.trust.timeout,
                        "oauth2 code exchange timed out"
                    );
                    return Err(Error::ProviderUnreachable(format!(
                        "no answer within {:?}",
                        binding.trust.timeout
                    )));
                }
            };

        binding.trust.check(&assertion)?;
        let user = self.resolve_provider_user(binding, &assertion).await?;
        if user.locked {
            return Err(Error::AccountLocked);
        }

        Ok(Identity::new(
            user.id,
            user.authorities,
            IssuedVia::OAuth2,
        ))
    }

    async fn resolve_provider_user(
        &self,
        binding: &OAuth2Binding,
        assertion: &ProviderAssertion,
    ) -> Result<UserRecord> {
        let kind = binding.provider.kind();

        if let Some(user) = self
            .users
            .find_user_by_provider(kind, &assertion.subject)
            .await
            .map_err(from_store)?
        {
            return Ok(user);
        }

        let email = assertion
            .email
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| Error::ProviderRejected("provider did not share an email".to_string()))?;

        if let Some(user) = self.users.find_user_by_email(email).await.map_err(from_store)? {
            if !email_verified(assertion) {
                tracing::warn!(
                    subject = %user.id,
                    provider = kind.as_str(),
                    "refused to link an unverified provider email to an existing account"
                );
                return Err(Error::ProviderRejected(
                    "provider email is not verified".to_string(),
                ));
            }
            self.users
                .link_provider(&user.id, kind, &assertion.subject)
                .await
                .map_err(from_store)?;
            tracing::info!(subject = %user.id, provider = kind.as_str(), "linked provider identity to existing account");
            return Ok(user);
        }

        let username = self.unique_username(assertion, email).await?;
        let user = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            username,
            email: email.to_string(),
            password_hash: None,
            authorities: [DEFAULT_AUTHORITY.to_string()].into(),
            provider: kind,
            provider_subject: Some(assertion.subject.clone()),
            locked: false,
        };
        self.users.insert_user(user.clone()).await.map_err(from_store)?;
        tracing::info!(subject = %user.id, provider = kind.as_str(), "provisioned account on first oauth2 login");
        Ok(user)
    }

    async fn unique_username(&self, assertion: &ProviderAssertion, email: &str) -> Result<String> {
        let base = username_base(assertion.display_name.as_deref(), email);
        if self
            .users
            .find_user_by_username(&base)
            .await
            .map_err(from_store)?
            .is_none()
        {
            return Ok(base);
        }
        for n in 2..100u32 {
            let candidate = format!("{base}{n}");
            if self
                .users
                .find_user_by_username(&candidate)
                .await
                .map_err(from_store)?
                .is_none()
            {
                return Ok(candidate);
            }
        }
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Ok(format!("{base}-{}", &suffix[..8]))
    }
}

/// Providers send `email_verified` as a boolean, some as the string "true".
fn email_verified(assertion: &ProviderAssertion) -> bool {
    match assertion.claims.get("email_verified") {
        Some(serde_json::Value::Bool(verified)) => *verified,
        Some(serde_json::Value::String(verified)) => verified.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Derive a username from the display name, falling back to the email local part.
fn username_base(display_name: Option<&str>, email: &str) -> String {
    let from = display_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| email.split('@').next().unwrap_or(email));
    let mut name: String = from
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
                Some(c.to_ascii_lowercase())
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .take(guard::USERNAME_MAX - 12)
        .collect();
    while name.chars().count() < guard::USERNAME_MIN {
        name.push('_');
    }
    name
}
