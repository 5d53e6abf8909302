//! Error types.

use jsonwebtoken::errors::ErrorKind;

pub use resonance_api::AuthError as Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Map a jsonwebtoken failure raised while verifying one of our own tokens.
///
/// The header has already been parsed and its algorithm checked by the caller, so a
/// base64 failure here can only come from the signature segment.
pub(crate) fn from_verify(err: &jsonwebtoken::errors::Error) -> Error {
    match err.kind() {
        ErrorKind::InvalidSignature | ErrorKind::Base64(_) => Error::InvalidSignature,
        ErrorKind::ExpiredSignature => Error::Expired,
        ErrorKind::InvalidAlgorithm => Error::UnsupportedAlgorithm(err.to_string()),
        ErrorKind::InvalidToken
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::MissingRequiredClaim(_) => Error::Malformed(err.to_string()),
        _ => Error::Internal(format!("token verification failed: {err}")),
    }
}

/// Map a jsonwebtoken failure raised while verifying a provider-issued id_token.
pub(crate) fn from_provider(err: &jsonwebtoken::errors::Error) -> Error {
    match err.kind() {
        ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => {
            Error::UntrustedIssuer(err.to_string())
        }
        _ => Error::ProviderRejected(format!("id_token rejected: {err}")),
    }
}

/// Collaborator failures keep their kind when it is already part of the taxonomy,
/// anything else means the store could not answer.
pub(crate) fn from_store(err: Error) -> Error {
    match err {
        Error::Unavailable(_) | Error::Conflict(_) => err,
        other => Error::Unavailable(other.to_string()),
    }
}
