use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use resonance_api::{AuthError, ProviderKind};
use resonance_auth::{
    Argon2Hasher, CookieOptions, DEFAULT_ACCESS_TTL, DEFAULT_MAX_REQUESTS, DEFAULT_REFRESH_TTL,
    DEFAULT_WINDOW, HashCost, SameSite, TokenAlgorithm, TokenLifetimes,
};
use serde::{Deserialize, Deserializer};

pub const CONFIG_FILE: &str = "auth.toml";
pub const ENV_SIGNING_KEY: &str = "RESONANCE_SIGNING_KEY";
pub const ENV_OAUTH2_CLIENT_SECRET: &str = "RESONANCE_OAUTH2_CLIENT_SECRET";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSettings {
    pub tokens: TokenSettings,
    pub password: PasswordSettings,
    pub oauth2: Option<OAuth2Settings>,
    pub cookie: CookieSettings,
    pub rate_limit: RateLimitSettings,
    pub server: ServerSettings,
    pub bootstrap: Option<BootstrapSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenSettings {
    pub algorithm: String,
    pub signing_key: Option<String>,
    pub signing_key_ref: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub public_key_path: Option<PathBuf>,
    pub key_id: Option<String>,
    #[serde(deserialize_with = "human_duration")]
    pub access_ttl: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub refresh_ttl: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub prune_interval: Duration,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            algorithm: TokenAlgorithm::Hs256.as_str().to_string(),
            signing_key: None,
            signing_key_ref: Some(ENV_SIGNING_KEY.to_string()),
            private_key_path: None,
            public_key_path: None,
            key_id: None,
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
            prune_interval: Duration::from_secs(600),
        }
    }
}

impl TokenSettings {
    pub fn algorithm(&self) -> Result<TokenAlgorithm, AuthError> {
        self.algorithm.parse()
    }

    pub fn lifetimes(&self) -> Result<TokenLifetimes, AuthError> {
        TokenLifetimes::new(self.access_ttl, self.refresh_ttl)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PasswordSettings {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordSettings {
    fn default() -> Self {
        let cost = HashCost::default();
        Self {
            memory_kib: cost.memory_kib,
            iterations: cost.iterations,
            parallelism: cost.parallelism,
        }
    }
}

impl PasswordSettings {
    pub fn cost(&self) -> HashCost {
        HashCost {
            memory_kib: self.memory_kib,
            iterations: self.iterations,
            parallelism: self.parallelism,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuth2Settings {
    pub provider: ProviderKind,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_secret_ref: Option<String>,
    pub issuer: String,
    pub token_url: String,
    #[serde(default)]
    pub userinfo_url: Option<String>,
    #[serde(default)]
    pub jwks_url: Option<String>,
    pub redirect_uri: String,
    #[serde(default = "default_oauth2_timeout", deserialize_with = "human_duration")]
    pub timeout: Duration,
}

fn default_oauth2_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CookieSettings {
    pub enabled: bool,
    pub name: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: String,
    pub host_prefix: bool,
}

impl Default for CookieSettings {
    fn default() -> Self {
        let defaults = CookieOptions::default();
        Self {
            enabled: true,
            name: defaults.name,
            domain: defaults.domain,
            secure: defaults.secure,
            http_only: defaults.http_only,
            same_site: "lax".to_string(),
            host_prefix: defaults.use_host_prefix,
        }
    }
}

impl CookieSettings {
    pub fn options(&self) -> Result<CookieOptions, AuthError> {
        let options = CookieOptions {
            name: self.name.clone(),
            path: "/".to_string(),
            domain: self.domain.clone(),
            secure: self.secure,
            http_only: self.http_only,
            same_site: self.same_site.parse::<SameSite>()?,
            use_host_prefix: self.host_prefix,
        };
        options.effective_name()?;
        Ok(options)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    #[serde(deserialize_with = "human_duration")]
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapSettings {
    pub admin_username: String,
    pub admin_email: String,
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default)]
    pub admin_password_ref: Option<String>,
}

fn human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

pub fn validate_settings(settings: &AuthSettings) -> Result<(), AuthError> {
    let tokens = &settings.tokens;
    let algorithm = tokens.algorithm()?;
    tokens.lifetimes()?;
    if tokens.prune_interval.is_zero() {
        return Err(AuthError::Config("tokens.prune_interval must be positive".to_string()));
    }

    if algorithm.is_hmac() {
        match (&tokens.signing_key, &tokens.signing_key_ref) {
            (Some(inline), _) => {
                let secret = resonance_auth::decode_secret(inline)?;
                if secret.len() < resonance_auth::MIN_HMAC_SECRET_BYTES {
                    return Err(AuthError::Config(format!(
                        "tokens.signing_key must be at least {} bytes",
                        resonance_auth::MIN_HMAC_SECRET_BYTES
                    )));
                }
            }
            (None, Some(r)) if !r.trim().is_empty() => {}
            _ => {
                return Err(AuthError::Config(
                    "tokens.signing_key or tokens.signing_key_ref is required".to_string(),
                ));
            }
        }
    } else if tokens.private_key_path.is_none() || tokens.public_key_path.is_none() {
        return Err(AuthError::Config(format!(
            "{algorithm} needs tokens.private_key_path and tokens.public_key_path"
        )));
    }

    Argon2Hasher::new(settings.password.cost())?;

    if let Some(oauth2) = &settings.oauth2 {
        validate_oauth2(oauth2)?;
    }

    settings.cookie.options()?;

    if settings.rate_limit.max_requests == 0 || settings.rate_limit.window.is_zero() {
        return Err(AuthError::Config(
            "rate_limit.max_requests and rate_limit.window must be positive".to_string(),
        ));
    }

    if let Some(bootstrap) = &settings.bootstrap {
        if bootstrap.admin_password.is_none() && bootstrap.admin_password_ref.is_none() {
            return Err(AuthError::Config(
                "bootstrap needs admin_password or admin_password_ref".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_oauth2(oauth2: &OAuth2Settings) -> Result<(), AuthError> {
    let required = [
        ("oauth2.client_id", &oauth2.client_id),
        ("oauth2.issuer", &oauth2.issuer),
        ("oauth2.token_url", &oauth2.token_url),
        ("oauth2.redirect_uri", &oauth2.redirect_uri),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(AuthError::Config(format!("{name} must not be empty")));
        }
    }
    if oauth2.provider == ProviderKind::Local {
        return Err(AuthError::Config("oauth2.provider cannot be local".to_string()));
    }
    if oauth2.client_secret.is_none() && oauth2.client_secret_ref.is_none() {
        return Err(AuthError::Config(
            "oauth2.client_secret or oauth2.client_secret_ref is required".to_string(),
        ));
    }
    if oauth2.userinfo_url.is_none() && oauth2.jwks_url.is_none() {
        return Err(AuthError::Config(
            "oauth2 needs userinfo_url or jwks_url to read the user profile".to_string(),
        ));
    }
    if oauth2.timeout.is_zero() {
        return Err(AuthError::Config("oauth2.timeout must be positive".to_string()));
    }
    Ok(())
}

/// Environment variables win over the file. `lookup` is `std::env::var` in production.
pub fn apply_env_overrides(settings: &mut AuthSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(key) = lookup(ENV_SIGNING_KEY).filter(|v| !v.is_empty()) {
        settings.tokens.signing_key = Some(key);
    }
    if let Some(oauth2) = settings.oauth2.as_mut() {
        if let Some(secret) = lookup(ENV_OAUTH2_CLIENT_SECRET).filter(|v| !v.is_empty()) {
            oauth2.client_secret = Some(secret);
        }
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("resonance")
    } else {
        PathBuf::from(".resonance")
    }
}

pub fn load_settings_from_dir(dir: &Path) -> Result<AuthSettings, AuthError> {
    load_settings_from_file(&dir.join(CONFIG_FILE))
}

pub fn load_settings_from_file(path: &Path) -> Result<AuthSettings, AuthError> {
    let content = fs::read_to_string(path)
        .map_err(|e| AuthError::Config(format!("failed to read {}: {e}", path.display())))?;
    parse_settings(&content).map_err(|e| match e {
        AuthError::Config(msg) => AuthError::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// Parse and validate. Environment overrides are not applied here.
pub fn parse_settings(content: &str) -> Result<AuthSettings, AuthError> {
    let settings: AuthSettings =
        toml::from_str(content).map_err(|e| AuthError::Config(format!("invalid TOML: {e}")))?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Write the annotated default `auth.toml` unless one already exists.
pub fn write_default_config_file(dir: &Path) -> Result<PathBuf, AuthError> {
    fs::create_dir_all(dir)
        .map_err(|e| AuthError::Internal(format!("failed to create {}: {e}", dir.display())))?;
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        fs::write(
            &path,
            include_str!("../../../docs/resonance/auth.toml.example"),
        )
        .map_err(|e| AuthError::Internal(format!("failed to write {}: {e}", path.display())))?;
    }
    Ok(path)
}
