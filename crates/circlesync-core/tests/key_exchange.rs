//! Property-based tests for circle key wrapping
//!
//! Uses proptest to check the wrap/unwrap round trip for both key sizes and
//! the exact boundary of the legacy plain-key fallback.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use circlesync_core::keys::{unwrap_key_from_peer, wrap_key_for_peer, KeySource};
use circlesync_core::{NodeKeypair, SyncError};
use proptest::prelude::*;

// ============================================================================
// Strategy Generators
// ============================================================================

/// Raw circle keys: 32 bytes (ChaCha20) or 16 bytes (legacy AES-128)
fn circle_key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 32),
        prop::collection::vec(any::<u8>(), 16),
    ]
}

/// Payload lengths that are never a valid legacy key
fn invalid_legacy_len() -> impl Strategy<Value = usize> {
    (0usize..64).prop_filter("not a key size", |len| *len != 16 && *len != 32)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_wrap_unwrap_roundtrip(key in circle_key_strategy()) {
        let alice = NodeKeypair::generate();
        let bob = NodeKeypair::generate();

        let wrapped = wrap_key_for_peer(&key, &alice, &bob.node_id()).unwrap();
        let unwrapped = unwrap_key_from_peer(&wrapped, &bob, &alice.node_id()).unwrap();

        prop_assert_eq!(unwrapped.key, key);
        prop_assert_eq!(unwrapped.source, KeySource::Wrapped);
    }

    #[test]
    fn prop_wrapped_key_is_bound_to_recipient(key in prop::collection::vec(any::<u8>(), 32)) {
        let alice = NodeKeypair::generate();
        let bob = NodeKeypair::generate();
        let eve = NodeKeypair::generate();

        let wrapped = wrap_key_for_peer(&key, &alice, &bob.node_id()).unwrap();
        // 12 + 32 + 16 bytes is not a legacy size, so nothing falls back
        let result = unwrap_key_from_peer(&wrapped, &eve, &alice.node_id());
        prop_assert!(matches!(result, Err(SyncError::DecryptFailure(_))));
    }

    #[test]
    fn prop_legacy_accepts_exact_key_sizes(key in circle_key_strategy()) {
        let alice = NodeKeypair::generate();
        let bob = NodeKeypair::generate();

        let unwrapped = unwrap_key_from_peer(&BASE64.encode(&key), &bob, &alice.node_id()).unwrap();
        prop_assert_eq!(unwrapped.key, key);
        prop_assert_eq!(unwrapped.source, KeySource::LegacyPlain);
    }

    #[test]
    fn prop_legacy_rejects_other_sizes(
        len in invalid_legacy_len(),
        fill in any::<u8>(),
    ) {
        let alice = NodeKeypair::generate();
        let bob = NodeKeypair::generate();

        let payload = BASE64.encode(vec![fill; len]);
        let result = unwrap_key_from_peer(&payload, &bob, &alice.node_id());
        prop_assert!(matches!(result, Err(SyncError::DecryptFailure(_))));
    }
}

#[test]
fn test_wrap_is_randomized() {
    let alice = NodeKeypair::generate();
    let bob = NodeKeypair::generate();
    let key = [7u8; 32];

    let first = wrap_key_for_peer(&key, &alice, &bob.node_id()).unwrap();
    let second = wrap_key_for_peer(&key, &alice, &bob.node_id()).unwrap();
    assert_ne!(first, second);
}

#[test]
fn test_non_base64_payload_is_decrypt_failure() {
    let alice = NodeKeypair::generate();
    let bob = NodeKeypair::generate();
    let result = unwrap_key_from_peer("not base64 !!", &bob, &alice.node_id());
    assert!(matches!(result, Err(SyncError::DecryptFailure(_))));
}
