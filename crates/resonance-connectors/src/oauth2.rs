//! Authorization-code exchange against a real OAuth2 / OIDC provider.

use std::time::Duration;

use async_trait::async_trait;
use resonance_api::{AuthError, OAuthProvider, ProviderAssertion, ProviderKind};
use resonance_auth::{IdTokenOptions, JwksSource, OidcVerifier};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct OAuth2Endpoints {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub userinfo_url: Option<String>,
    /// When set, an id_token in the token response is verified against this JWKS and
    /// preferred over the userinfo endpoint.
    pub jwks_url: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct HttpOAuthProvider {
    kind: ProviderKind,
    endpoints: OAuth2Endpoints,
    client: reqwest::Client,
    oidc: OidcVerifier,
}

impl HttpOAuthProvider {
    pub fn new(kind: ProviderKind, endpoints: OAuth2Endpoints) -> Result<Self, AuthError> {
        if endpoints.userinfo_url.is_none() && endpoints.jwks_url.is_none() {
            return Err(AuthError::Config(
                "oauth2 provider needs a userinfo or jwks url".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(endpoints.request_timeout)
            .build()
            .map_err(|e| AuthError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            kind,
            endpoints,
            client,
            oidc: OidcVerifier::new(),
        })
    }

    async fn redeem(&self, code: &str) -> Result<TokenResponse, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.endpoints.redirect_uri.as_str()),
            ("client_id", self.endpoints.client_id.as_str()),
            ("client_secret", self.endpoints.client_secret.as_str()),
        ];
        let resp = self
            .client
            .post(&self.endpoints.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error("token endpoint", &e))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(AuthError::ProviderUnreachable(format!(
                "token endpoint answered {status}"
            )));
        }
        let body = resp.text().await.map_err(|e| transport_error("token endpoint", &e))?;
        if !status.is_success() {
            let reason = serde_json::from_str::<TokenErrorResponse>(&body).map_or_else(
                |_| status.to_string(),
                |e| match e.error_description {
                    Some(d) => format!("{}: {d}", e.error),
                    None => e.error,
                },
            );
            return Err(AuthError::ProviderRejected(reason));
        }
        serde_json::from_str(&body)
            .map_err(|e| AuthError::ProviderRejected(format!("unexpected token response: {e}")))
    }

    async fn userinfo(&self, url: &str, access_token: &str) -> Result<Value, AuthError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error("userinfo endpoint", &e))?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(AuthError::ProviderUnreachable(format!(
                "userinfo endpoint answered {status}"
            )));
        }
        if !status.is_success() {
            return Err(AuthError::ProviderRejected(format!(
                "userinfo endpoint answered {status}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| AuthError::ProviderRejected(format!("unexpected userinfo response: {e}")))
    }
}

#[async_trait]
impl OAuthProvider for HttpOAuthProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderAssertion, AuthError> {
        let tokens = self.redeem(code).await?;

        if let (Some(id_token), Some(jwks_url)) = (&tokens.id_token, &self.endpoints.jwks_url) {
            let opts = IdTokenOptions::new(&self.endpoints.issuer, &self.endpoints.client_id);
            let verified = self
                .oidc
                .verify_id_token(id_token, &JwksSource::Url(jwks_url.clone()), &opts)
                .await?;
            tracing::debug!(provider = self.kind.as_str(), "profile taken from verified id_token");
            return verified.into_assertion();
        }

        let url = self.endpoints.userinfo_url.as_deref().ok_or_else(|| {
            AuthError::ProviderRejected("provider returned no id_token and no userinfo url is configured".to_string())
        })?;
        let profile = self.userinfo(url, &tokens.access_token).await?;
        tracing::debug!(provider = self.kind.as_str(), "profile taken from userinfo endpoint");
        // The profile came from the configured endpoint with a token issued to us.
        map_profile(
            self.kind,
            &self.endpoints.issuer,
            &self.endpoints.client_id,
            profile,
        )
    }
}

/// Map a provider's profile document to an assertion.
///
/// Google and generic OIDC use `sub`/`name`/`email`, Spotify uses
/// `id`/`display_name`/`email`.
pub fn map_profile(
    kind: ProviderKind,
    issuer: &str,
    client_id: &str,
    profile: Value,
) -> Result<ProviderAssertion, AuthError> {
    let text = |key: &str| {
        profile
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let (subject, display_name) = match kind {
        ProviderKind::Google => (text("sub"), text("name")),
        ProviderKind::Spotify => (text("id"), text("display_name")),
        ProviderKind::Oidc => (text("sub"), text("name").or_else(|| text("preferred_username"))),
        ProviderKind::Local => {
            return Err(AuthError::Config("local accounts have no provider profile".to_string()));
        }
    };
    let subject = subject.ok_or_else(|| {
        AuthError::ProviderRejected(format!("{} profile has no subject", kind.as_str()))
    })?;
    let email = text("email");
    Ok(ProviderAssertion {
        issuer: issuer.to_string(),
        audience: vec![client_id.to_string()],
        subject,
        email,
        display_name,
        claims: profile,
    })
}

fn transport_error(what: &str, err: &reqwest::Error) -> AuthError {
    AuthError::ProviderUnreachable(format!("{what}: {err}"))
}

#[cfg(test)]
mod tests {
    use axum::extract::Form;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn google_profile_mapping() {
        let a = map_profile(
            ProviderKind::Google,
            "https://accounts.google.com",
            "c1",
            json!({"sub": "g-1", "name": "Ada", "email": "ada@example.com"}),
        )
        .unwrap();
        assert_eq!(a.subject, "g-1");
        assert_eq!(a.display_name.as_deref(), Some("Ada"));
        assert_eq!(a.audience, vec!["c1".to_string()]);
    }

    #[test]
    fn spotify_profile_mapping() {
        let a = map_profile(
            ProviderKind::Spotify,
            "https://accounts.spotify.com",
            "c1",
            json!({"id": "sp-1", "display_name": "ada", "email": "ada@example.com"}),
        )
        .unwrap();
        assert_eq!(a.subject, "sp-1");
        assert_eq!(a.display_name.as_deref(), Some("ada"));
        assert_eq!(a.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn profile_without_subject_is_rejected() {
        let err = map_profile(ProviderKind::Spotify, "i", "c", json!({"email": "x@y.io"})).unwrap_err();
        assert!(matches!(err, AuthError::ProviderRejected(_)));
    }

    async fn fake_provider() -> String {
        async fn token(Form(form): Form<HashMap<String, String>>) -> (StatusCode, Json<Value>) {
            if form.get("code").map(String::as_str) == Some("good") {
                (StatusCode::OK, Json(json!({"access_token": "at-1", "token_type": "Bearer"})))
            } else {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid_grant", "error_description": "code expired"})),
                )
            }
        }
        async fn me(headers: HeaderMap) -> (StatusCode, Json<Value>) {
            match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                Some("Bearer at-1") => (
                    StatusCode::OK,
                    Json(json!({"id": "sp-7", "display_name": "Ada", "email": "ada@example.com"})),
                ),
                _ => (StatusCode::UNAUTHORIZED, Json(json!({}))),
            }
        }

        let app = Router::new()
            .route("/token", post(token))
            .route("/me", get(me));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(base: &str) -> HttpOAuthProvider {
        HttpOAuthProvider::new(
            ProviderKind::Spotify,
            OAuth2Endpoints {
                issuer: "https://accounts.spotify.com".into(),
                client_id: "client-1".into(),
                client_secret: "secret".into(),
                token_url: format!("{base}/token"),
                redirect_uri: "http://localhost/cb".into(),
                userinfo_url: Some(format!("{base}/me")),
                jwks_url: None,
                request_timeout: Duration::from_secs(5),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn code_exchange_reads_userinfo() {
        let base = fake_provider().await;
        let assertion = provider(&base).exchange_code("good").await.unwrap();
        assert_eq!(assertion.subject, "sp-7");
        assert_eq!(assertion.issuer, "https://accounts.spotify.com");
        assert_eq!(assertion.audience, vec!["client-1".to_string()]);
    }

    #[tokio::test]
    async fn refused_code_is_provider_rejected() {
        let base = fake_provider().await;
        let err = provider(&base).exchange_code("stale").await.unwrap_err();
        assert_eq!(
            err,
            AuthError::ProviderRejected("invalid_grant: code expired".into())
        );
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = provider(&format!("http://{addr}")).exchange_code("good").await.unwrap_err();
        assert!(err.is_transient());
    }
}
