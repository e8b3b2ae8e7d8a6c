//! Token structure, canonical signing bytes, and the issuer.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use sos_types::{CapabilityAction, Subject};

use crate::{VerifyError, VerifyResult};

/// Version byte prefixed to the signing data; bump when the layout changes.
const SIGNING_DATA_VERSION: u8 = 0x01;

/// Append a 4-byte little-endian length followed by the bytes.
fn write_length_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// A signed authorization grant.
///
/// Field declaration order is the stable JSON ordering; `signature` covers
/// every preceding field via [`CapabilityToken::signing_bytes`]. Constraints
/// use a `BTreeMap` so their serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityToken {
    /// Unique token identifier; keys the verifier's uses ledger.
    pub id: Uuid,
    /// Grantee: `agent:<name>` or `service:<name>`.
    pub subject: Subject,
    /// The single action granted.
    pub action: CapabilityAction,
    /// Glob-able resource pattern, e.g. `memory:agent:kasra/*`.
    pub resource: String,
    /// Free-form constraints (`max_amount`, `rate_limit`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constraints: BTreeMap<String, Value>,
    /// Issue timestamp.
    pub issued_at: DateTime<Utc>,
    /// Absolute expiry; the token is invalid at exactly this instant.
    pub expires_at: DateTime<Utc>,
    /// Issuing subject.
    pub issuer: Subject,
    /// Remaining uses; `None` means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uses_remaining: Option<u32>,
    /// Base64 ed25519 signature over the signing bytes.
    pub signature: String,
}

impl CapabilityToken {
    /// The canonical bytes the signature covers.
    ///
    /// Layout: version byte, then each field length-prefixed in declaration
    /// order. Timestamps are signed little-endian epoch seconds; the uses
    /// counter is a presence byte followed by a little-endian u32.
    pub fn signing_bytes(&self) -> VerifyResult<Vec<u8>> {
        let mut data = vec![SIGNING_DATA_VERSION];
        write_length_prefixed(&mut data, self.id.as_bytes());
        write_length_prefixed(&mut data, self.subject.as_str().as_bytes());
        write_length_prefixed(&mut data, self.action.as_str().as_bytes());
        write_length_prefixed(&mut data, self.resource.as_bytes());
        let constraints = serde_json::to_vec(&self.constraints)
            .map_err(|e| VerifyError::MalformedToken(format!("constraints: {e}")))?;
        write_length_prefixed(&mut data, &constraints);
        data.extend_from_slice(&self.issued_at.timestamp().to_le_bytes());
        data.extend_from_slice(&self.expires_at.timestamp().to_le_bytes());
        write_length_prefixed(&mut data, self.issuer.as_str().as_bytes());
        match self.uses_remaining {
            Some(uses) => {
                data.push(1);
                data.extend_from_slice(&uses.to_le_bytes());
            }
            None => data.push(0),
        }
        Ok(data)
    }

    /// Decode the base64 signature into raw ed25519 bytes.
    pub(crate) fn signature_bytes(&self) -> VerifyResult<[u8; 64]> {
        let raw = B64
            .decode(&self.signature)
            .map_err(|_| VerifyError::MalformedToken("signature is not base64".into()))?;
        raw.try_into()
            .map_err(|_| VerifyError::MalformedToken("signature has wrong length".into()))
    }
}

/// The root gatekeeper's signing half.
///
/// Holds the only copy of the issuer private key; nothing outside this type
/// may touch it. Everything else verifies against the exported public key.
pub struct TokenIssuer {
    signing_key: SigningKey,
    issuer: Subject,
}

impl TokenIssuer {
    /// Generate a fresh issuer keypair.
    pub fn generate(issuer: Subject) -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            issuer,
        }
    }

    /// Restore an issuer from a 32-byte secret key.
    pub fn from_secret_key(issuer: Subject, bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
            issuer,
        }
    }

    /// The public verification key to hand to [`crate::TokenVerifier`]s.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message envelope's payload in place.
    pub fn sign_envelope(&self, envelope: &mut sos_types::MessageEnvelope) -> VerifyResult<()> {
        let bytes = envelope
            .payload_bytes()
            .map_err(|e| VerifyError::MalformedToken(e.to_string()))?;
        let signature = self.signing_key.sign(&bytes);
        envelope.signature = Some(B64.encode(signature.to_bytes()));
        Ok(())
    }

    /// Issue a signed token valid for `ttl` from now.
    pub fn issue(
        &self,
        subject: Subject,
        action: CapabilityAction,
        resource: &str,
        constraints: BTreeMap<String, Value>,
        ttl: Duration,
        uses_remaining: Option<u32>,
    ) -> VerifyResult<CapabilityToken> {
        let issued_at = Utc::now();
        let mut token = CapabilityToken {
            id: Uuid::new_v4(),
            subject,
            action,
            resource: resource.to_owned(),
            constraints,
            issued_at,
            expires_at: issued_at + ttl,
            issuer: self.issuer.clone(),
            uses_remaining,
            signature: String::new(),
        };
        let signature = self.signing_key.sign(&token.signing_bytes()?);
        token.signature = B64.encode(signature.to_bytes());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::generate(Subject::service("gatekeeper"))
    }

    #[test]
    fn issued_tokens_carry_expected_fields() {
        let token = issuer()
            .issue(
                Subject::agent("kasra"),
                CapabilityAction::MemoryRead,
                "memory:agent:kasra/*",
                BTreeMap::new(),
                Duration::minutes(5),
                Some(3),
            )
            .unwrap();
        assert_eq!(token.action, CapabilityAction::MemoryRead);
        assert_eq!(token.uses_remaining, Some(3));
        assert!(token.expires_at > token.issued_at);
        assert!(!token.signature.is_empty());
    }

    #[test]
    fn signing_bytes_are_sensitive_to_every_field() {
        let token = issuer()
            .issue(
                Subject::agent("kasra"),
                CapabilityAction::ToolExecute,
                "engine:chat",
                BTreeMap::new(),
                Duration::minutes(5),
                None,
            )
            .unwrap();
        let baseline = token.signing_bytes().unwrap();

        let mut tampered = token.clone();
        tampered.resource = "engine:*".into();
        assert_ne!(baseline, tampered.signing_bytes().unwrap());

        let mut tampered = token.clone();
        tampered.uses_remaining = Some(1);
        assert_ne!(baseline, tampered.signing_bytes().unwrap());

        let mut tampered = token;
        tampered.expires_at = tampered.expires_at + Duration::hours(10);
        assert_ne!(baseline, tampered.signing_bytes().unwrap());
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let mut constraints = BTreeMap::new();
        constraints.insert("max_amount".to_string(), serde_json::json!(100));
        let token = issuer()
            .issue(
                Subject::agent("kasra"),
                CapabilityAction::LedgerWrite,
                "ledger:agent:kasra/*",
                constraints,
                Duration::hours(1),
                Some(10),
            )
            .unwrap();
        let json = serde_json::to_string(&token).unwrap();
        let back: CapabilityToken = serde_json::from_str(&json).unwrap();
        assert_eq!(token, back);
        assert_eq!(token.signing_bytes().unwrap(), back.signing_bytes().unwrap());
    }
}
