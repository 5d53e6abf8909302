//! resonance-auth
//!
//! The authentication and session core: signed bearer tokens, credential checks and
//! the per-request gate.
//!
//! - [`codec`] signs and verifies compact tokens with a key whose algorithm is fixed
//!   at construction, so a token header can never pick the algorithm.
//! - [`CredentialVerifier`] turns a password or an OAuth2 authorization code into an
//!   [`Identity`](resonance_api::Identity).
//! - [`SessionIssuer`] issues access/refresh pairs and rotates refresh tokens, revoking
//!   the whole token family when a spent refresh token is replayed.
//! - [`AuthGate`] resolves an `Authorization: Bearer` header (or session cookie) to an
//!   identity and rejects opaquely.
//!
//! ## Quick start
//! ```no_run
//! use std::sync::Arc;
//! use resonance_api::{Identity, IssuedVia, RevocationStore};
//! use resonance_auth::{AuthGate, SessionIssuer, TokenAlgorithm, TokenKeys, TokenLifetimes};
//!
//! # async fn demo(revocations: Arc<dyn RevocationStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let keys = Arc::new(TokenKeys::hmac(TokenAlgorithm::Hs256, &[7u8; 32])?);
//! let issuer = SessionIssuer::new(keys.clone(), revocations, TokenLifetimes::default());
//! let gate = AuthGate::new(keys);
//!
//! let pair = issuer.issue(&Identity::new("u1", ["READ"], IssuedVia::Local))?;
//! let header = format!("Bearer {}", pair.access_token);
//! let identity = gate.authenticate(Some(&header))?;
//! assert_eq!(identity.subject_id(), "u1");
//!
//! let rotated = issuer.refresh(&pair.refresh_token).await?;
//! # let _ = rotated;
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]

pub mod codec;
mod cookie;
mod credentials;
mod error;
mod gate;
pub mod guard;
mod keys;
mod oidc;
mod password;
mod rate_limit;
mod registration;
mod session;

pub use cookie::{CookieOptions, SameSite, build_clear_cookie, build_set_cookie, read_cookie};
pub use credentials::{CredentialVerifier, ProviderTrust};
pub use error::{Error, Result};
pub use gate::{AuthGate, Unauthenticated, parse_bearer};
pub use keys::{
    MIN_HMAC_SECRET_BYTES, SigningKey, TokenAlgorithm, TokenKeys, VerificationKey, decode_secret,
};
pub use oidc::{IdTokenOptions, Jwk, JwkSet, JwksSource, OidcVerifier, VerifiedIdToken};
pub use password::{Argon2Hasher, HashCost};
pub use rate_limit::{DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW, RateDecision, RateLimiter};
pub use registration::{RegisterRequest, Registrar};
pub use session::{DEFAULT_ACCESS_TTL, DEFAULT_REFRESH_TTL, MAX_TOKEN_TTL, SessionIssuer, TokenLifetimes};
