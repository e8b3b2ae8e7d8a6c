#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-capability** – Capability-based authorization for the SOS platform.
//!
//! A capability token is an unforgeable grant: `subject` may perform
//! `action` on resources matching `resource` until `expires_at`, at most
//! `uses_remaining` times. Tokens are plain JSON structs carrying an
//! ed25519 signature over their canonical signing bytes, so any holder of
//! the issuer's *public* key can verify them without shared secrets.
//!
//! The crate splits issuance from verification: only the root gatekeeper
//! holds a [`TokenIssuer`] (and with it the signing key); every service
//! holds a [`TokenVerifier`]. Revocation is implicit via short TTLs.

use serde::{Deserialize, Serialize};

pub mod token;
pub mod transport;
pub mod verifier;

pub use token::{CapabilityToken, TokenIssuer};
pub use transport::{decode_token, encode_token, token_from_bearer};
pub use verifier::TokenVerifier;

/// Why verification rejected a token.
///
/// The order of checks is fixed: shape, signature, expiry, action, resource,
/// uses. The first failing check names the error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum VerifyError {
    /// Token could not be decoded or has an unusable shape.
    #[error("malformed token: {0}")]
    MalformedToken(String),
    /// Signature does not verify under the issuer public key.
    #[error("invalid signature")]
    InvalidSignature,
    /// `now >= expires_at`.
    #[error("token expired")]
    Expired,
    /// The uses-remaining counter reached zero.
    #[error("token uses exhausted")]
    UsesExhausted,
    /// Requested action differs from the granted action.
    #[error("action mismatch")]
    ActionMismatch,
    /// Requested resource does not match the granted pattern.
    #[error("resource mismatch")]
    ResourceMismatch,
}

impl From<VerifyError> for sos_types::SosError {
    fn from(err: VerifyError) -> Self {
        sos_types::SosError::Authorization(err.to_string())
    }
}

/// Crate result alias.
pub type VerifyResult<T> = std::result::Result<T, VerifyError>;
