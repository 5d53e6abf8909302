//! Per-request authentication gate.
//!
//! The gate only reads: it verifies the presented access token and rebuilds the
//! identity from its claims. Callers get an opaque [`Unauthenticated`] on failure;
//! the precise reason is logged at debug level and never leaves the process.

use std::sync::Arc;

use resonance_api::{Identity, TokenClaims, TokenType};

use crate::codec;
use crate::cookie::read_cookie;
use crate::keys::TokenKeys;
use crate::{Error, Result};

/// Opaque rejection returned to request handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unauthenticated")]
pub struct Unauthenticated;

#[derive(Debug, Clone)]
pub struct AuthGate {
    keys: Arc<TokenKeys>,
}

impl AuthGate {
    pub fn new(keys: Arc<TokenKeys>) -> Self {
        Self { keys }
    }

    /// Resolve an `Authorization` header value to an identity.
    pub fn authenticate(&self, authorization: Option<&str>) -> std::result::Result<Identity, Unauthenticated> {
        self.inspect(authorization).map_err(opaque)
    }

    /// Same as [`authenticate`](Self::authenticate), reading the token from a named cookie.
    pub fn authenticate_cookie(
        &self,
        cookie_header: Option<&str>,
        cookie_name: &str,
    ) -> std::result::Result<Identity, Unauthenticated> {
        let token = cookie_header
            .and_then(|h| read_cookie(h, cookie_name))
            .ok_or_else(|| Error::Malformed(format!("no {cookie_name} cookie")))
            .map_err(opaque)?;
        self.verify_access_token(token).map_err(opaque)
    }

    /// Detailed variant of [`authenticate`](Self::authenticate), for diagnostics.
    pub fn inspect(&self, authorization: Option<&str>) -> Result<Identity> {
        let header =
            authorization.ok_or_else(|| Error::Malformed("missing authorization header".to_string()))?;
        let token = parse_bearer(header)?;
        self.verify_access_token(token)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Identity> {
        let claims: TokenClaims = codec::verify(token, self.keys.verification())?;
        if claims.token_type != TokenType::Access {
            return Err(Error::WrongTokenType {
                expected: TokenType::Access,
                found: claims.token_type,
            });
        }
        Ok(claims.identity())
    }
}

/// Extract the token from `Bearer <token>`. The scheme is case-insensitive.
pub fn parse_bearer(header: &str) -> Result<&str> {
    let (scheme, token) = header
        .trim()
        .split_once(char::is_whitespace)
        .ok_or_else(|| Error::Malformed("authorization header has no credentials".to_string()))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(Error::Malformed(format!("unsupported authorization scheme {scheme}")));
    }
    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(Error::Malformed("bearer token is empty or contains whitespace".to_string()));
    }
    Ok(token)
}

fn opaque(err: Error) -> Unauthenticated {
    tracing::debug!(kind = err.kind(), error = %err, "request not authenticated");
    Unauthenticated
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use resonance_api::IssuedVia;

    use super::*;
    use crate::keys::TokenAlgorithm;
    use crate::session::{SessionIssuer, TokenLifetimes};

    struct NoRevocations;

    #[async_trait::async_trait]
    impl resonance_api::RevocationStore for NoRevocations {
        async fn find_revocation(&self, _: &str) -> Result<Option<resonance_api::RevocationRecord>> {
            Ok(None)
        }
        async fn insert_revocation(&self, _: &str, _: u64) -> Result<bool> {
            Ok(true)
        }
        async fn revoke_family(&self, _: &str, _: u64) -> Result<()> {
            Ok(())
        }
        async fn is_family_revoked(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn prune_expired(&self, _: u64) -> Result<usize> {
            Ok(0)
        }
    }

    fn setup() -> (AuthGate, SessionIssuer) {
        let keys = Arc::new(TokenKeys::hmac(TokenAlgorithm::Hs384, &[3u8; 48]).unwrap());
        let issuer = SessionIssuer::new(
            keys.clone(),
            Arc::new(NoRevocations),
            TokenLifetimes::new(Duration::from_secs(60), Duration::from_secs(600)).unwrap(),
        );
        (AuthGate::new(keys), issuer)
    }

    fn identity() -> Identity {
        Identity::new("u1", ["READ", "WRITE"], IssuedVia::OAuth2)
    }

    #[test]
    fn bearer_access_token_resolves_identity() {
        let (gate, issuer) = setup();
        let pair = issuer.issue(&identity()).unwrap();
        let header = format!("Bearer {}", pair.access_token);
        assert_eq!(gate.authenticate(Some(&header)).unwrap(), identity());

        let lower = format!("bearer   {}", pair.access_token);
        assert_eq!(gate.authenticate(Some(&lower)).unwrap(), identity());
    }

    #[test]
    fn refresh_token_is_refused_opaquely() {
        let (gate, issuer) = setup();
        let pair = issuer.issue(&identity()).unwrap();
        let header = format!("Bearer {}", pair.refresh_token);
        assert_eq!(
            gate.inspect(Some(&header)).unwrap_err(),
            Error::WrongTokenType {
                expected: TokenType::Access,
                found: TokenType::Refresh
            }
        );
        assert_eq!(gate.authenticate(Some(&header)).unwrap_err(), Unauthenticated);
    }

    #[test]
    fn missing_or_foreign_scheme_is_unauthenticated() {
        let (gate, _) = setup();
        assert_eq!(gate.authenticate(None), Err(Unauthenticated));
        assert_eq!(gate.authenticate(Some("Basic dTpw")), Err(Unauthenticated));
        assert_eq!(gate.authenticate(Some("Bearer")), Err(Unauthenticated));
        assert_eq!(gate.authenticate(Some("Bearer not.a.token")), Err(Unauthenticated));
    }

    #[test]
    fn cookie_transport_is_accepted() {
        let (gate, issuer) = setup();
        let pair = issuer.issue(&identity()).unwrap();
        let cookies = format!("theme=dark; __Host-resonance_session={}", pair.access_token);
        assert_eq!(
            gate.authenticate_cookie(Some(&cookies), "__Host-resonance_session").unwrap(),
            identity()
        );
        assert_eq!(
            gate.authenticate_cookie(Some("theme=dark"), "__Host-resonance_session"),
            Err(Unauthenticated)
        );
    }

    #[test]
    fn parse_bearer_extracts_token() {
        assert_eq!(parse_bearer("Bearer abc.def.ghi").unwrap(), "abc.def.ghi");
        assert_eq!(parse_bearer("BEARER x").unwrap(), "x");
        assert!(parse_bearer("Bearer a b").is_err());
        assert!(parse_bearer("Token x").is_err());
    }
}
