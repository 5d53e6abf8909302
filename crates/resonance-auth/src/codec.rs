//! Compact signed tokens (`header.payload.signature`).
//!
//! Both functions are pure: keys come in as arguments and nothing is cached.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use jsonwebtoken::{Header, Validation};
use serde_json::Value;

use resonance_api::TokenClaims;

use crate::error::from_verify;
use crate::keys::{SigningKey, VerificationKey};
use crate::{Error, Result};

/// Sign `claims` with the key's fixed algorithm.
pub fn sign(claims: &TokenClaims, key: &SigningKey) -> Result<String> {
    check_representable(claims)?;

    let mut header = Header::new(key.algorithm().jwt());
    header.typ = Some("JWT".to_string());
    header.kid = key.key_id().map(str::to_string);

    jsonwebtoken::encode(&header, claims, key.encoding_key())
        .map_err(|e| Error::Encoding(e.to_string()))
}

/// Verify a token and return its claims.
///
/// The header's `alg` is compared against the key; it never chooses the key.
pub fn verify(token: &str, key: &VerificationKey) -> Result<TokenClaims> {
    let alg = peek_algorithm(token)?;
    if alg != key.algorithm().as_str() {
        return Err(Error::UnsupportedAlgorithm(alg));
    }

    let mut validation = Validation::new(key.algorithm().jwt());
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp", "iat", "sub", "jti"]);

    let data = jsonwebtoken::decode::<TokenClaims>(token, key.decoding_key(), &validation)
        .map_err(|e| from_verify(&e))?;

    let claims = data.claims;
    if claims.expires_at <= claims.issued_at {
        return Err(Error::Malformed("token expires before it was issued".to_string()));
    }
    Ok(claims)
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn check_representable(claims: &TokenClaims) -> Result<()> {
    if claims.subject.trim().is_empty() {
        return Err(Error::Encoding("subject is empty".to_string()));
    }
    if claims.token_id.trim().is_empty() {
        return Err(Error::Encoding("token id is empty".to_string()));
    }
    if claims.family_id.trim().is_empty() {
        return Err(Error::Encoding("family id is empty".to_string()));
    }
    if claims.expires_at <= claims.issued_at {
        return Err(Error::Encoding(format!(
            "expires_at ({}) must be after issued_at ({})",
            claims.expires_at, claims.issued_at
        )));
    }
    if i64::try_from(claims.expires_at).is_err() {
        return Err(Error::Encoding("expires_at out of range".to_string()));
    }
    if claims.authorities.iter().any(|a| a.trim().is_empty()) {
        return Err(Error::Encoding("authority names must not be blank".to_string()));
    }
    Ok(())
}

/// Structural pre-parse: three segments and a header naming a string `alg`.
fn peek_algorithm(token: &str) -> Result<String> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Malformed("expected three dot-separated segments".to_string()));
    };
    if header.is_empty() || payload.is_empty() {
        return Err(Error::Malformed("empty header or payload segment".to_string()));
    }

    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| Error::Malformed(format!("header is not base64url: {e}")))?;
    let header: Value = serde_json::from_slice(&raw)
        .map_err(|e| Error::Malformed(format!("header is not JSON: {e}")))?;

    header
        .get("alg")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Malformed("header has no alg".to_string()))
}
