//! Error types.

use authgate_api::GatewayError;
use thiserror::Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// JWT is malformed or missing required fields.
    #[error("invalid JWT: {0}")]
    InvalidJwt(String),

    /// Algorithm is not in the RSA family.
    #[error("unsupported JWT algorithm: {0:?}")]
    UnsupportedAlg(jsonwebtoken::Algorithm),

    /// Token is past its expiry.
    #[error("token expired")]
    Expired,

    /// Signature or claims failed validation.
    #[error("token validation failed: {0}")]
    Validation(String),

    /// PEM key material is missing or cannot be parsed.
    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    /// A token operation ran before any key material was loaded.
    #[error("key material not loaded")]
    KeysNotLoaded,

    /// The private key could not produce a signature.
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl Error {
    /// Key and signing failures mean the configured key pair is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::KeyMaterial(_) | Error::KeysNotLoaded | Error::Signing(_)
        )
    }
}

impl From<Error> for GatewayError {
    fn from(err: Error) -> Self {
        if err.is_fatal() {
            GatewayError::KeyMaterial(err.to_string())
        } else {
            GatewayError::Auth(err.to_string())
        }
    }
}
