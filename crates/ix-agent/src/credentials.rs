//! Broker credentials.
//!
//! The connection manager asks its [`CredentialProvider`] for a password on
//! every connection attempt. Static passwords never change; signed tokens
//! are RS256 JWTs valid for [`TOKEN_LIFETIME_SECS`] from the moment they are
//! minted, so a reconnect always presents a fresh one.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

/// Validity window of a signed token (20 minutes).
pub const TOKEN_LIFETIME_SECS: i64 = 20 * 60;

/// Errors from loading signing keys or minting tokens.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read private key '{path}': {source}")]
    ReadKey {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid RSA private key: {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),
    #[error("token signing failed: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

/// Produces the password presented to the broker.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Result<String, CredentialError>;

    /// Short label for logs.
    fn kind(&self) -> &'static str;
}

// ── Static ────────────────────────────────────────────────────

/// A fixed password.
pub struct StaticCredential {
    password: String,
}

impl StaticCredential {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredential")
            .field("password", &"<redacted>")
            .finish()
    }
}

impl CredentialProvider for StaticCredential {
    fn credential(&self) -> Result<String, CredentialError> {
        Ok(self.password.clone())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

// ── Signed token ──────────────────────────────────────────────

/// JWT claim set of a broker token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Source of "now" for token timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Mints an RS256 token per call.
pub struct SignedTokenCredential {
    key: EncodingKey,
    audience: String,
    clock: Clock,
}

impl SignedTokenCredential {
    /// Build from a PEM-encoded RSA private key (PKCS#1 or PKCS#8).
    pub fn from_pem(pem: &[u8], audience: impl Into<String>) -> Result<Self, CredentialError> {
        let key = EncodingKey::from_rsa_pem(pem).map_err(CredentialError::InvalidKey)?;
        Ok(Self {
            key,
            audience: audience.into(),
            clock: Arc::new(Utc::now),
        })
    }

    pub fn from_file(path: &Path, audience: impl Into<String>) -> Result<Self, CredentialError> {
        let pem = std::fs::read(path).map_err(|source| CredentialError::ReadKey {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_pem(&pem, audience)
    }

    /// Replace the wall clock (tests).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn claims_at(&self, now: DateTime<Utc>) -> TokenClaims {
        let iat = now.timestamp();
        TokenClaims {
            aud: self.audience.clone(),
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
        }
    }
}

impl CredentialProvider for SignedTokenCredential {
    fn credential(&self) -> Result<String, CredentialError> {
        let claims = self.claims_at((self.clock)());
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(CredentialError::Signing)
    }

    fn kind(&self) -> &'static str {
        "jwt"
    }
}

/// Extract the audience (project ID) from a client ID made of alternating
/// `key/value` path segments, e.g. `projects/p/locations/l/devices/d`.
///
/// Pairs start at the first segment; a trailing unpaired segment is ignored
/// and later duplicates win.
pub fn audience_from_client_id(client_id: &str) -> Option<String> {
    let segments: Vec<&str> = client_id.split('/').collect();
    segments
        .chunks_exact(2)
        .filter(|pair| pair[0] == "projects")
        .map(|pair| pair[1])
        .last()
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
