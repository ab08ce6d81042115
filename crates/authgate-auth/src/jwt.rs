//! Token issuance and verification with an RSA key pair.

use crate::{Error, Result};

use authgate_api::{STAGE_JWT_PRIVATE_KEY, STAGE_JWT_PUBLIC_KEY, StageVariables};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Tokens expire this long after issuance.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Claim holding the expiry as a string-encoded Unix timestamp.
pub const CLAIM_EXPIRE: &str = "expire";

/// Claim holding the authenticated principal.
pub const CLAIM_USERNAME: &str = "username";

/// Algorithms accepted on verification.
pub const RSA_ALGORITHMS: [Algorithm; 6] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// Token claims.
///
/// `expire` is the wire-level expiry clients read; `exp` carries the same
/// instant so the standard claim validation applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Unix seconds, string-encoded.
    pub expire: String,
    /// Authenticated principal.
    pub username: String,
    /// Unix seconds.
    pub exp: u64,
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn parse(public_pem: &str, private_pem: &str) -> Result<Self> {
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| Error::KeyMaterial(format!("public key: {e}")))?;
        let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| Error::KeyMaterial(format!("private key: {e}")))?;
        Ok(Self { encoding, decoding })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").finish_non_exhaustive()
    }
}

/// Issues and verifies tokens.
///
/// The key pair is parsed at most once per authority. Concurrent first
/// callers block until one parse completes; later calls are no-ops.
#[derive(Debug, Default)]
pub struct TokenAuthority {
    keys: OnceCell<KeyPair>,
}

impl TokenAuthority {
    /// An authority with no key material yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// An authority with the key pair parsed eagerly.
    pub fn from_pem(public_pem: &str, private_pem: &str) -> Result<Self> {
        let authority = Self::new();
        authority
            .keys
            .get_or_try_init(|| KeyPair::parse(public_pem, private_pem))?;
        Ok(authority)
    }

    /// True once a key pair has been parsed.
    pub fn keys_loaded(&self) -> bool {
        self.keys.get().is_some()
    }

    /// Parse `JWTPublicKey` and `JWTPrivateKey` from stage variables unless a
    /// key pair is already cached.
    ///
    /// Errors are fatal: the gateway cannot serve with broken keys.
    pub fn ensure_keys_loaded(&self, stage: &StageVariables) -> Result<()> {
        self.keys.get_or_try_init(|| {
            let public = stage.get(STAGE_JWT_PUBLIC_KEY).ok_or_else(|| {
                Error::KeyMaterial(format!("stage variable {STAGE_JWT_PUBLIC_KEY} is missing"))
            })?;
            let private = stage.get(STAGE_JWT_PRIVATE_KEY).ok_or_else(|| {
                Error::KeyMaterial(format!(
                    "stage variable {STAGE_JWT_PRIVATE_KEY} is missing"
                ))
            })?;
            debug!("parsing JWT key material");
            KeyPair::parse(public, private)
        })?;
        Ok(())
    }

    /// Sign a token for `username` expiring [`TOKEN_LIFETIME`] from now.
    pub fn issue_token(&self, username: &str) -> Result<String> {
        self.issue_token_at(username, SystemTime::now())
    }

    /// Sign a token as if issued at `issued_at`.
    pub fn issue_token_at(&self, username: &str, issued_at: SystemTime) -> Result<String> {
        let keys = self.keys.get().ok_or(Error::KeysNotLoaded)?;
        let exp = unix_seconds(issued_at + TOKEN_LIFETIME);
        let claims = Claims {
            expire: exp.to_string(),
            username: username.to_string(),
            exp,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &keys.encoding)
            .map_err(|e| Error::Signing(e.to_string()))
    }

    /// Verify `token` and return its `username` claim.
    pub fn verify_token(&self, token: &str) -> Result<String> {
        let keys = self.keys.get().ok_or(Error::KeysNotLoaded)?;

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::InvalidJwt(format!("failed to decode header: {e}")))?;

        if !RSA_ALGORITHMS.contains(&header.alg) {
            return Err(Error::UnsupportedAlg(header.alg));
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<Claims>(token, &keys.decoding, &validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => Error::Expired,
                _ => Error::Validation(e.to_string()),
            },
        )?;

        let expire: u64 = data.claims.expire.parse().map_err(|_| {
            Error::InvalidJwt(format!("{CLAIM_EXPIRE} is not a unix timestamp"))
        })?;
        if expire < unix_seconds(SystemTime::now()) {
            return Err(Error::Expired);
        }

        Ok(data.claims.username)
    }
}

/// Accept both `Bearer <token>` and a bare token.
pub fn strip_bearer(value: &str) -> &str {
    value.strip_prefix("Bearer ").unwrap_or(value)
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}
