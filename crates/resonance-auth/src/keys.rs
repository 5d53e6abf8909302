//! Signing and verification keys.
//!
//! Keys are built once at startup and shared read-only. The algorithm is a property
//! of the key, never of the token being checked.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};

use crate::{Error, Result};

/// Minimum shared-secret length accepted for the HMAC family.
pub const MIN_HMAC_SECRET_BYTES: usize = 32;

/// Algorithms this service signs its own tokens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAlgorithm {
    Hs256,
    Hs384,
    Hs512,
    EdDsa,
}

impl TokenAlgorithm {
    /// Header value as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            TokenAlgorithm::Hs256 => "HS256",
            TokenAlgorithm::Hs384 => "HS384",
            TokenAlgorithm::Hs512 => "HS512",
            TokenAlgorithm::EdDsa => "EdDSA",
        }
    }

    pub fn is_hmac(self) -> bool {
        !matches!(self, TokenAlgorithm::EdDsa)
    }

    pub(crate) fn jwt(self) -> Algorithm {
        match self {
            TokenAlgorithm::Hs256 => Algorithm::HS256,
            TokenAlgorithm::Hs384 => Algorithm::HS384,
            TokenAlgorithm::Hs512 => Algorithm::HS512,
            TokenAlgorithm::EdDsa => Algorithm::EdDSA,
        }
    }
}

impl fmt::Display for TokenAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "HS256" => Ok(TokenAlgorithm::Hs256),
            "HS384" => Ok(TokenAlgorithm::Hs384),
            "HS512" => Ok(TokenAlgorithm::Hs512),
            "EdDSA" => Ok(TokenAlgorithm::EdDsa),
            other => Err(Error::Config(format!("unsupported signing algorithm {other}"))),
        }
    }
}

/// Private half used by the issuer.
#[derive(Clone)]
pub struct SigningKey {
    algorithm: TokenAlgorithm,
    key_id: Option<String>,
    inner: EncodingKey,
}

impl SigningKey {
    pub fn hmac(algorithm: TokenAlgorithm, secret: &[u8]) -> Result<Self> {
        check_hmac(algorithm, secret)?;
        Ok(Self {
            algorithm,
            key_id: None,
            inner: EncodingKey::from_secret(secret),
        })
    }

    pub fn ed25519_pem(pem: &[u8]) -> Result<Self> {
        let inner = EncodingKey::from_ed_pem(pem)
            .map_err(|e| Error::Config(format!("invalid Ed25519 private key: {e}")))?;
        Ok(Self {
            algorithm: TokenAlgorithm::EdDsa,
            key_id: None,
            inner,
        })
    }

    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn algorithm(&self) -> TokenAlgorithm {
        self.algorithm
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.inner
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Public (or shared) half used by the codec and the gate.
#[derive(Clone)]
pub struct VerificationKey {
    algorithm: TokenAlgorithm,
    inner: DecodingKey,
}

impl VerificationKey {
    pub fn hmac(algorithm: TokenAlgorithm, secret: &[u8]) -> Result<Self> {
        check_hmac(algorithm, secret)?;
        Ok(Self {
            algorithm,
            inner: DecodingKey::from_secret(secret),
        })
    }

    pub fn ed25519_pem(pem: &[u8]) -> Result<Self> {
        let inner = DecodingKey::from_ed_pem(pem)
            .map_err(|e| Error::Config(format!("invalid Ed25519 public key: {e}")))?;
        Ok(Self {
            algorithm: TokenAlgorithm::EdDsa,
            inner,
        })
    }

    pub fn algorithm(&self) -> TokenAlgorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.inner
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// The process-wide key pair.
#[derive(Debug, Clone)]
pub struct TokenKeys {
    signing: SigningKey,
    verification: VerificationKey,
}

impl TokenKeys {
    pub fn new(signing: SigningKey, verification: VerificationKey) -> Result<Self> {
        if signing.algorithm() != verification.algorithm() {
            return Err(Error::Config(format!(
                "signing key uses {} but verification key uses {}",
                signing.algorithm(),
                verification.algorithm()
            )));
        }
        Ok(Self {
            signing,
            verification,
        })
    }

    /// Both halves from one shared secret.
    pub fn hmac(algorithm: TokenAlgorithm, secret: &[u8]) -> Result<Self> {
        Self::new(
            SigningKey::hmac(algorithm, secret)?,
            VerificationKey::hmac(algorithm, secret)?,
        )
    }

    pub fn signing(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verification(&self) -> &VerificationKey {
        &self.verification
    }
}

/// Decode a configured secret. `base64:` and `hex:` prefixes are honoured,
/// anything else is taken as raw UTF-8 bytes.
pub fn decode_secret(value: &str) -> Result<Vec<u8>> {
    let value = value.trim();
    if let Some(b64) = value.strip_prefix("base64:") {
        return base64::engine::general_purpose::STANDARD
            .decode(b64)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(b64))
            .map_err(|e| Error::Config(format!("signing key is not valid base64: {e}")));
    }
    if let Some(digits) = value.strip_prefix("hex:") {
        return hex::decode(digits)
            .map_err(|e| Error::Config(format!("signing key is not valid hex: {e}")));
    }
    Ok(value.as_bytes().to_vec())
}

fn check_hmac(algorithm: TokenAlgorithm, secret: &[u8]) -> Result<()> {
    if !algorithm.is_hmac() {
        return Err(Error::Config(format!(
            "{algorithm} needs a key pair, not a shared secret"
        )));
    }
    if secret.len() < MIN_HMAC_SECRET_BYTES {
        return Err(Error::Config(format!(
            "shared secret must be at least {MIN_HMAC_SECRET_BYTES} bytes, got {}",
            secret.len()
        )));
    }
    Ok(())
}
