//! Token verification: signature, expiry, action, resource glob, uses.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use globset::GlobBuilder;
use tracing::debug;
use uuid::Uuid;

use sos_types::CapabilityAction;

use crate::{CapabilityToken, VerifyError, VerifyResult};

/// Verifies presented tokens against the known issuer public key.
///
/// Tokens are immutable once signed, so the uses-remaining counter is
/// enforced through a verifier-side ledger keyed by token id and seeded
/// from the token on first sight. The ledger is process-local; a restart
/// forgets partial consumption, which short TTLs make acceptable.
pub struct TokenVerifier {
    issuer_key: VerifyingKey,
    uses_ledger: DashMap<Uuid, u32>,
}

impl TokenVerifier {
    /// Create a verifier trusting `issuer_key`.
    pub fn new(issuer_key: VerifyingKey) -> Self {
        Self {
            issuer_key,
            uses_ledger: DashMap::new(),
        }
    }

    /// Verify `token` for `action` on `resource` at the current instant.
    ///
    /// On success a finite uses counter is decremented; failures never
    /// consume a use.
    pub fn verify(
        &self,
        token: &CapabilityToken,
        action: CapabilityAction,
        resource: &str,
    ) -> VerifyResult<()> {
        self.verify_at(token, action, resource, Utc::now())
    }

    /// Verification with an explicit clock; `now == expires_at` is invalid.
    pub fn verify_at(
        &self,
        token: &CapabilityToken,
        action: CapabilityAction,
        resource: &str,
        now: DateTime<Utc>,
    ) -> VerifyResult<()> {
        // 1. Signature under the issuer public key.
        let signature = Signature::from_bytes(&token.signature_bytes()?);
        self.issuer_key
            .verify(&token.signing_bytes()?, &signature)
            .map_err(|_| VerifyError::InvalidSignature)?;

        // 2. Expiry (strict: the expiry instant itself is already invalid).
        if now >= token.expires_at {
            return Err(VerifyError::Expired);
        }

        // 3. Action equality.
        if token.action != action {
            return Err(VerifyError::ActionMismatch);
        }

        // 4. Resource pattern, `*` bounded by `/` segments.
        if !resource_matches(&token.resource, resource)? {
            return Err(VerifyError::ResourceMismatch);
        }

        // 5. Uses-remaining, if finite.
        if let Some(initial) = token.uses_remaining {
            let mut entry = self.uses_ledger.entry(token.id).or_insert(initial);
            if *entry == 0 {
                return Err(VerifyError::UsesExhausted);
            }
            *entry -= 1;
            debug!(token = %token.id, remaining = *entry, "capability use consumed");
        }

        Ok(())
    }

    /// Remaining uses the ledger currently records for `token_id`, if any.
    pub fn uses_remaining(&self, token_id: Uuid) -> Option<u32> {
        self.uses_ledger.get(&token_id).map(|entry| *entry)
    }

    /// Drop ledger entries for expired tokens; returns how many were reaped.
    pub fn reap_ledger(&self, live_token_ids: &[Uuid]) -> usize {
        let before = self.uses_ledger.len();
        self.uses_ledger.retain(|id, _| live_token_ids.contains(id));
        before - self.uses_ledger.len()
    }

    /// Opportunistic envelope verification: unsigned envelopes pass,
    /// signed ones must verify under the issuer key.
    pub fn verify_envelope(&self, envelope: &sos_types::MessageEnvelope) -> VerifyResult<()> {
        let Some(encoded) = &envelope.signature else {
            return Ok(());
        };
        let raw = B64
            .decode(encoded)
            .map_err(|_| VerifyError::MalformedToken("envelope signature is not base64".into()))?;
        let raw: [u8; 64] = raw
            .try_into()
            .map_err(|_| VerifyError::MalformedToken("envelope signature has wrong length".into()))?;
        let bytes = envelope
            .payload_bytes()
            .map_err(|e| VerifyError::MalformedToken(e.to_string()))?;
        self.issuer_key
            .verify(&bytes, &Signature::from_bytes(&raw))
            .map_err(|_| VerifyError::InvalidSignature)
    }
}

/// Glob match with `*` confined to one `/`-separated segment.
fn resource_matches(pattern: &str, resource: &str) -> VerifyResult<bool> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| VerifyError::MalformedToken(format!("resource pattern: {e}")))?;
    Ok(glob.compile_matcher().is_match(resource))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokenIssuer;
    use chrono::Duration;
    use sos_types::Subject;
    use std::collections::BTreeMap;

    fn setup() -> (TokenIssuer, TokenVerifier) {
        let issuer = TokenIssuer::generate(Subject::service("gatekeeper"));
        let verifier = TokenVerifier::new(issuer.verifying_key());
        (issuer, verifier)
    }

    fn grant(
        issuer: &TokenIssuer,
        action: CapabilityAction,
        resource: &str,
        ttl_secs: i64,
        uses: Option<u32>,
    ) -> CapabilityToken {
        issuer
            .issue(
                Subject::agent("kasra"),
                action,
                resource,
                BTreeMap::new(),
                Duration::seconds(ttl_secs),
                uses,
            )
            .unwrap()
    }

    #[test]
    fn valid_token_verifies() {
        let (issuer, verifier) = setup();
        let token = grant(&issuer, CapabilityAction::MemoryRead, "memory:agent:kasra/*", 60, None);
        verifier
            .verify(&token, CapabilityAction::MemoryRead, "memory:agent:kasra/notes")
            .unwrap();
    }

    #[test]
    fn tampered_token_fails_signature() {
        let (issuer, verifier) = setup();
        let mut token = grant(&issuer, CapabilityAction::MemoryRead, "memory:agent:kasra/*", 60, None);
        token.resource = "memory:agent:*/*".into();
        assert_eq!(
            verifier.verify(&token, CapabilityAction::MemoryRead, "memory:agent:other/x"),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn foreign_issuer_fails_signature() {
        let (issuer, _) = setup();
        let other = TokenIssuer::generate(Subject::service("impostor"));
        let verifier = TokenVerifier::new(other.verifying_key());
        let token = grant(&issuer, CapabilityAction::MemoryRead, "memory:agent:kasra/*", 60, None);
        assert_eq!(
            verifier.verify(&token, CapabilityAction::MemoryRead, "memory:agent:kasra/x"),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let (issuer, verifier) = setup();
        let token = grant(&issuer, CapabilityAction::MemoryRead, "memory:agent:kasra/*", 60, None);
        // Exactly at expires_at: invalid.
        assert_eq!(
            verifier.verify_at(
                &token,
                CapabilityAction::MemoryRead,
                "memory:agent:kasra/x",
                token.expires_at,
            ),
            Err(VerifyError::Expired)
        );
        // One second earlier: valid.
        verifier
            .verify_at(
                &token,
                CapabilityAction::MemoryRead,
                "memory:agent:kasra/x",
                token.expires_at - Duration::seconds(1),
            )
            .unwrap();
    }

    #[test]
    fn action_mismatch() {
        let (issuer, verifier) = setup();
        let token = grant(&issuer, CapabilityAction::MemoryRead, "memory:agent:kasra/*", 60, None);
        assert_eq!(
            verifier.verify(&token, CapabilityAction::MemoryWrite, "memory:agent:kasra/x"),
            Err(VerifyError::ActionMismatch)
        );
    }

    #[test]
    fn wildcard_stops_at_segment_boundary() {
        let (issuer, verifier) = setup();
        let token = grant(&issuer, CapabilityAction::MemoryRead, "memory:agent:kasra/*", 60, None);
        verifier
            .verify(&token, CapabilityAction::MemoryRead, "memory:agent:kasra/notes")
            .unwrap();
        assert_eq!(
            verifier.verify(&token, CapabilityAction::MemoryRead, "memory:agent:kasra/deep/notes"),
            Err(VerifyError::ResourceMismatch)
        );
        assert_eq!(
            verifier.verify(&token, CapabilityAction::MemoryRead, "memory:agent:other/notes"),
            Err(VerifyError::ResourceMismatch)
        );
    }

    #[test]
    fn uses_deplete_and_exhaust() {
        let (issuer, verifier) = setup();
        let token = grant(&issuer, CapabilityAction::ToolExecute, "engine:chat", 60, Some(2));
        verifier.verify(&token, CapabilityAction::ToolExecute, "engine:chat").unwrap();
        verifier.verify(&token, CapabilityAction::ToolExecute, "engine:chat").unwrap();
        assert_eq!(
            verifier.verify(&token, CapabilityAction::ToolExecute, "engine:chat"),
            Err(VerifyError::UsesExhausted)
        );
        assert_eq!(verifier.uses_remaining(token.id), Some(0));
    }

    #[test]
    fn envelope_signing_round_trip() {
        use sos_types::{MessageEnvelope, MessageKind};

        let (issuer, verifier) = setup();
        let mut envelope = MessageEnvelope::new(
            MessageKind::TaskCreate,
            Subject::service("daemon"),
            "sos:queue:global",
            serde_json::json!({"task_id": "t-1"}),
        );
        // Unsigned envelopes pass opportunistic verification.
        verifier.verify_envelope(&envelope).unwrap();

        issuer.sign_envelope(&mut envelope).unwrap();
        verifier.verify_envelope(&envelope).unwrap();

        // Tampering with the payload invalidates the signature.
        envelope.payload.content = serde_json::json!({"task_id": "t-2"});
        assert_eq!(
            verifier.verify_envelope(&envelope),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn failures_do_not_consume_uses() {
        let (issuer, verifier) = setup();
        let token = grant(&issuer, CapabilityAction::ToolExecute, "engine:chat", 60, Some(1));
        // Mismatched action: no use consumed.
        let _ = verifier.verify(&token, CapabilityAction::MemoryRead, "engine:chat");
        verifier.verify(&token, CapabilityAction::ToolExecute, "engine:chat").unwrap();
    }
}
