//! authgate-auth
//!
//! Issues and validates the gateway's signed session tokens.
//!
//! - **Issuing** RS256 tokens carrying a `username` and a 24 hour expiry
//! - **Verifying** tokens against the configured RSA public key, rejecting
//!   non-RSA algorithms, bad signatures and expired tokens
//! - **Caching key material** parsed once from PEM stage variables
//!
//! The core API is [`TokenAuthority`], which owns the key pair. Keys are
//! loaded lazily from stage variables the first time a handler needs them.
//!
//! ## Quick start
//! ```no_run
//! use authgate_api::StageVariables;
//! use authgate_auth::TokenAuthority;
//!
//! # fn demo(stage: &StageVariables) -> Result<(), authgate_auth::Error> {
//! let authority = TokenAuthority::new();
//! authority.ensure_keys_loaded(stage)?;
//!
//! let token = authority.issue_token("alice")?;
//! assert_eq!(authority.verify_token(&token)?, "alice");
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]

mod error;
mod jwt;

pub use error::{Error, Result};
pub use jwt::{
    CLAIM_EXPIRE, CLAIM_USERNAME, Claims, RSA_ALGORITHMS, TOKEN_LIFETIME, TokenAuthority,
    strip_bearer,
};
