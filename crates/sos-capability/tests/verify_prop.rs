//! Property coverage for token verification: the conjunction law and the
//! serialize/deserialize round trip.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use proptest::prelude::*;
use sos_capability::{CapabilityToken, TokenIssuer, TokenVerifier, VerifyError};
use sos_types::{CapabilityAction, Subject};

const ACTIONS: [CapabilityAction; 4] = [
    CapabilityAction::MemoryRead,
    CapabilityAction::MemoryWrite,
    CapabilityAction::ToolExecute,
    CapabilityAction::LedgerRead,
];

fn issue(
    issuer: &TokenIssuer,
    action: CapabilityAction,
    ttl_secs: i64,
    uses: Option<u32>,
) -> CapabilityToken {
    issuer
        .issue(
            Subject::agent("prop"),
            action,
            "memory:agent:prop/*",
            BTreeMap::new(),
            Duration::seconds(ttl_secs),
            uses,
        )
        .unwrap()
}

proptest! {
    // Verify succeeds iff signature ∧ unexpired ∧ action ∧ resource ∧ uses.
    #[test]
    fn verify_is_the_conjunction_of_its_checks(
        granted_idx in 0usize..ACTIONS.len(),
        asked_idx in 0usize..ACTIONS.len(),
        ttl_offset in -300i64..300i64,
        uses in prop::option::of(0u32..4),
        resource_ok in any::<bool>(),
    ) {
        let issuer = TokenIssuer::generate(Subject::service("gatekeeper"));
        let verifier = TokenVerifier::new(issuer.verifying_key());

        // ttl_offset <= 0 builds an already-expired (or exactly-expiring) token.
        let token = issue(&issuer, ACTIONS[granted_idx], ttl_offset, uses);
        let asked = ACTIONS[asked_idx];
        let resource = if resource_ok {
            "memory:agent:prop/notes"
        } else {
            "memory:agent:other/notes"
        };
        let now = Utc::now();

        let expect_ok = now < token.expires_at
            && asked == ACTIONS[granted_idx]
            && resource_ok
            && uses.map(|u| u > 0).unwrap_or(true);

        let outcome = verifier.verify_at(&token, asked, resource, now);
        prop_assert_eq!(outcome.is_ok(), expect_ok, "outcome {:?}", outcome);
    }

    // Round trip: serialize → deserialize leaves both the token and its
    // verification outcome unchanged.
    #[test]
    fn serialization_preserves_verification(
        granted_idx in 0usize..ACTIONS.len(),
        ttl_secs in 10i64..600,
    ) {
        let issuer = TokenIssuer::generate(Subject::service("gatekeeper"));
        let token = issue(&issuer, ACTIONS[granted_idx], ttl_secs, None);

        let bytes = serde_json::to_vec(&token).unwrap();
        let restored: CapabilityToken = serde_json::from_slice(&bytes).unwrap();
        prop_assert_eq!(&token, &restored);

        // Fresh verifiers per side so the uses ledger cannot interfere.
        let a = TokenVerifier::new(issuer.verifying_key());
        let b = TokenVerifier::new(issuer.verifying_key());
        let now = Utc::now();
        let lhs = a.verify_at(&token, ACTIONS[granted_idx], "memory:agent:prop/x", now);
        let rhs = b.verify_at(&restored, ACTIONS[granted_idx], "memory:agent:prop/x", now);
        prop_assert_eq!(lhs, rhs);
    }
}

#[test]
fn exhausted_token_reports_uses_exhausted_not_mismatch() {
    let issuer = TokenIssuer::generate(Subject::service("gatekeeper"));
    let verifier = TokenVerifier::new(issuer.verifying_key());
    let token = issue(&issuer, CapabilityAction::ToolExecute, 60, Some(0));
    assert_eq!(
        verifier.verify(&token, CapabilityAction::ToolExecute, "memory:agent:prop/x"),
        Err(VerifyError::UsesExhausted)
    );
}
