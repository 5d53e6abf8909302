use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use resonance_api::{
    AuthError, Identity, OAuthProvider, RevocationStore, SecretStore, TokenPair, UserStore,
};
use resonance_auth::{
    Argon2Hasher, AuthGate, CookieOptions, CredentialVerifier, ProviderTrust, RateDecision,
    RateLimiter, RegisterRequest, Registrar, SessionIssuer, SigningKey, TokenKeys,
    Unauthenticated, VerificationKey, build_clear_cookie, build_set_cookie, codec, decode_secret,
};
use resonance_connectors::{
    EnvSecretStore, HttpOAuthProvider, MemoryRevocationStore, MemoryUserStore, OAuth2Endpoints,
};
use resonance_core::{AuthSettings, OAuth2Settings, TokenSettings, validate_settings};
use serde::Serialize;

/// Authority given to the bootstrap administrator on top of the default one.
pub const ADMIN_AUTHORITY: &str = "ROLE_ADMIN";

/// External collaborators the runtime is wired with.
pub struct Collaborators {
    pub users: Arc<dyn UserStore>,
    pub revocations: Arc<dyn RevocationStore>,
    pub secrets: Arc<dyn SecretStore>,
    /// Overrides the HTTP provider built from `[oauth2]`.
    pub oauth2: Option<Arc<dyn OAuthProvider>>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(MemoryUserStore::new()),
            revocations: Arc::new(MemoryRevocationStore::new()),
            secrets: Arc::new(EnvSecretStore),
            oauth2: None,
        }
    }
}

/// Outcome of a successful login or registration.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub identity: Identity,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

pub struct AuthRuntime {
    keys: Arc<TokenKeys>,
    users: Arc<dyn UserStore>,
    verifier: CredentialVerifier,
    registrar: Registrar,
    issuer: SessionIssuer,
    gate: AuthGate,
    limiter: RateLimiter,
    cookie: Option<CookieOptions>,
    prune_interval: Duration,
}

impl AuthRuntime {
    /// In-memory stores, secrets from the environment, HTTP provider from `[oauth2]`.
    pub fn from_settings(settings: &AuthSettings) -> Result<Self, AuthError> {
        Self::new(settings, Collaborators::in_memory())
    }

    pub fn new(settings: &AuthSettings, parts: Collaborators) -> Result<Self, AuthError> {
        validate_settings(settings)?;

        let keys = Arc::new(keys_from_settings(&settings.tokens, parts.secrets.as_ref())?);
        let lifetimes = settings.tokens.lifetimes()?;
        let hasher = Argon2Hasher::new(settings.password.cost())?;

        let mut verifier = CredentialVerifier::new(parts.users.clone(), hasher.clone())?;
        match (&settings.oauth2, parts.oauth2) {
            (Some(oauth2), provider) => {
                let provider = match provider {
                    Some(p) => p,
                    None => http_provider(oauth2, parts.secrets.as_ref())?,
                };
                let trust = ProviderTrust::new(&oauth2.issuer, &oauth2.client_id)
                    .with_timeout(oauth2.timeout);
                verifier = verifier.with_oauth2(provider, trust);
            }
            (None, Some(_)) => {
                return Err(AuthError::Config(
                    "an oauth2 provider was supplied but [oauth2] is not configured".to_string(),
                ));
            }
            (None, None) => {}
        }

        let cookie = if settings.cookie.enabled {
            Some(settings.cookie.options()?)
        } else {
            None
        };

        tracing::info!(
            algorithm = %keys.signing().algorithm(),
            access_ttl = ?lifetimes.access,
            refresh_ttl = ?lifetimes.refresh,
            oauth2 = verifier.oauth2_enabled(),
            "auth runtime ready"
        );

        Ok(Self {
            issuer: SessionIssuer::new(keys.clone(), parts.revocations, lifetimes),
            gate: AuthGate::new(keys.clone()),
            registrar: Registrar::new(parts.users.clone(), hasher),
            users: parts.users,
            verifier,
            keys,
            limiter: RateLimiter::new(settings.rate_limit.max_requests, settings.rate_limit.window),
            cookie,
            prune_interval: settings.tokens.prune_interval,
        })
    }

    pub fn keys(&self) -> &TokenKeys {
        &self.keys
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    pub fn issuer(&self) -> &SessionIssuer {
        &self.issuer
    }

    pub fn oauth2_enabled(&self) -> bool {
        self.verifier.oauth2_enabled()
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<Session, AuthError> {
        let identity = self.registrar.register(request).await?;
        self.open_session(identity)
    }

    pub async fn login(&self, login: &str, password: &str) -> Result<Session, AuthError> {
        let identity = self.verifier.verify_local(login, password).await?;
        self.open_session(identity)
    }

    pub async fn oauth2_login(&self, code: &str) -> Result<Session, AuthError> {
        let identity = self.verifier.verify_oauth2(code).await?;
        self.open_session(identity)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        self.issuer.refresh(refresh_token).await
    }

    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        self.issuer.revoke(token).await
    }

    /// Resolve a request: the `Authorization` header first, then the session cookie.
    pub fn authenticate(
        &self,
        authorization: Option<&str>,
        cookie_header: Option<&str>,
    ) -> Result<Identity, Unauthenticated> {
        if authorization.is_some() {
            return self.gate.authenticate(authorization);
        }
        match &self.cookie {
            Some(opts) => {
                let name = opts.effective_name().map_err(|_| Unauthenticated)?;
                self.gate.authenticate_cookie(cookie_header, &name)
            }
            None => self.gate.authenticate(None),
        }
    }

    pub fn check_rate(&self, client: &str) -> RateDecision {
        self.limiter.check(client)
    }

    /// `Set-Cookie` value carrying the access token, when cookie transport is on.
    pub fn session_cookie(&self, tokens: &TokenPair) -> Option<String> {
        let opts = self.cookie.as_ref()?;
        build_set_cookie(
            &tokens.access_token,
            Duration::from_secs(tokens.expires_in),
            opts,
        )
        .ok()
    }

    pub fn clear_cookie(&self) -> Option<String> {
        build_clear_cookie(self.cookie.as_ref()?).ok()
    }

    /// Create the configured administrator unless that username already exists.
    pub async fn bootstrap_admin(
        &self,
        settings: &AuthSettings,
        secrets: &dyn SecretStore,
    ) -> Result<Option<Identity>, AuthError> {
        let Some(bootstrap) = &settings.bootstrap else {
            return Ok(None);
        };
        if self
            .users
            .find_user_by_username(&bootstrap.admin_username)
            .await?
            .is_some()
        {
            return Ok(None);
        }
        let password = resolve_secret(
            bootstrap.admin_password.as_deref(),
            bootstrap.admin_password_ref.as_deref(),
            secrets,
            "bootstrap admin password",
        )?;
        let identity = self
            .registrar
            .provision(
                &bootstrap.admin_email,
                &bootstrap.admin_username,
                &password,
                &[resonance_api::DEFAULT_AUTHORITY, ADMIN_AUTHORITY],
            )
            .await?;
        tracing::warn!(username = %bootstrap.admin_username, "bootstrapped administrator account");
        Ok(Some(identity))
    }

    /// One maintenance pass: expired revocation records and closed rate windows.
    pub async fn prune_now(&self) -> Result<usize, AuthError> {
        let swept = self.limiter.sweep();
        let pruned = self.issuer.prune(codec::unix_now()).await?;
        Ok(pruned + swept)
    }

    /// Run [`prune_now`](Self::prune_now) every `tokens.prune_interval` until the runtime is dropped.
    pub fn spawn_pruner(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.prune_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(runtime) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = runtime.prune_now().await {
                    tracing::warn!(error = %e, "revocation pruning failed");
                }
            }
        })
    }

    fn open_session(&self, identity: Identity) -> Result<Session, AuthError> {
        let tokens = self.issuer.issue(&identity)?;
        Ok(Session { identity, tokens })
    }
}

/// Build the process key pair from `[tokens]`.
pub fn keys_from_settings(
    tokens: &TokenSettings,
    secrets: &dyn SecretStore,
) -> Result<TokenKeys, AuthError> {
    let algorithm = tokens.algorithm()?;
    let (signing, verification) = if algorithm.is_hmac() {
        let raw = resolve_secret(
            tokens.signing_key.as_deref(),
            tokens.signing_key_ref.as_deref(),
            secrets,
            "signing key",
        )?;
        let secret = decode_secret(&raw)?;
        (
            SigningKey::hmac(algorithm, &secret)?,
            VerificationKey::hmac(algorithm, &secret)?,
        )
    } else {
        let private = read_key_file(tokens.private_key_path.as_deref(), "private key")?;
        let public = read_key_file(tokens.public_key_path.as_deref(), "public key")?;
        (
            SigningKey::ed25519_pem(&private)?,
            VerificationKey::ed25519_pem(&public)?,
        )
    };
    let signing = match &tokens.key_id {
        Some(kid) => signing.with_key_id(kid.clone()),
        None => signing,
    };
    TokenKeys::new(signing, verification)
}

fn read_key_file(path: Option<&Path>, what: &str) -> Result<Vec<u8>, AuthError> {
    let path = path.ok_or_else(|| AuthError::Config(format!("{what} path missing")))?;
    std::fs::read(path)
        .map_err(|e| AuthError::Config(format!("failed to read {}: {e}", path.display())))
}

fn http_provider(
    oauth2: &OAuth2Settings,
    secrets: &dyn SecretStore,
) -> Result<Arc<dyn OAuthProvider>, AuthError> {
    let client_secret = resolve_secret(
        oauth2.client_secret.as_deref(),
        oauth2.client_secret_ref.as_deref(),
        secrets,
        "oauth2 client secret",
    )?;
    let provider = HttpOAuthProvider::new(
        oauth2.provider,
        OAuth2Endpoints {
            issuer: oauth2.issuer.clone(),
            client_id: oauth2.client_id.clone(),
            client_secret,
            token_url: oauth2.token_url.clone(),
            redirect_uri: oauth2.redirect_uri.clone(),
            userinfo_url: oauth2.userinfo_url.clone(),
            jwks_url: oauth2.jwks_url.clone(),
            request_timeout: oauth2.timeout,
        },
    )?;
    Ok(Arc::new(provider))
}

fn resolve_secret(
    inline: Option<&str>,
    reference: Option<&str>,
    secrets: &dyn SecretStore,
    what: &str,
) -> Result<String, AuthError> {
    if let Some(value) = inline.filter(|v| !v.is_empty()) {
        return Ok(value.to_string());
    }
    let reference =
        reference.ok_or_else(|| AuthError::Config(format!("no {what} configured")))?;
    secrets.get(reference)
}
