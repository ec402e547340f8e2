/// Property tests for opaque identity tokens.
///
/// Every failure mode of decryption must collapse to `None`: tampering,
/// truncation, a foreign key or a foreign context.
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use passgate::cipher::{NONCE_SIZE, TAG_SIZE};
use passgate::{TokenCipher, format_key, generate_key, parse_key};
use proptest::prelude::*;

fn key_strategy() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

fn identity_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_roundtrip(
        key in key_strategy(),
        identity in identity_strategy(),
        deterministic in any::<bool>(),
    ) {
        let cipher = TokenCipher::new(&key, "session").unwrap().with_unique_key(b"uk".to_vec());
        let token = cipher.encrypt(&identity, deterministic).unwrap();

        prop_assert!(!token.contains('='));
        prop_assert!(!token.contains('+'));
        prop_assert!(!token.contains('/'));
        prop_assert_eq!(cipher.decrypt(&token), Some(identity));
    }

    #[test]
    fn prop_token_length(key in key_strategy(), identity in identity_strategy()) {
        let cipher = TokenCipher::new(&key, "session").unwrap();
        let token = cipher.encrypt(&identity, false).unwrap();
        let raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        prop_assert_eq!(raw.len(), NONCE_SIZE + identity.len() + TAG_SIZE);
    }

    #[test]
    fn prop_context_separation(
        key in key_strategy(),
        identity in identity_strategy(),
        ctx_a in "[a-z]{1,12}",
        ctx_b in "[a-z]{1,12}",
    ) {
        prop_assume!(ctx_a != ctx_b);
        let a = TokenCipher::new(&key, ctx_a).unwrap();
        let b = TokenCipher::new(&key, ctx_b).unwrap();

        let token = a.encrypt(&identity, false).unwrap();
        prop_assert!(b.decrypt(&token).is_none());
    }

    #[test]
    fn prop_bit_flip_rejected(
        key in key_strategy(),
        identity in identity_strategy(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let cipher = TokenCipher::new(&key, "session").unwrap();
        let token = cipher.encrypt(&identity, false).unwrap();

        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let at = position.index(raw.len());
        raw[at] ^= 1 << bit;

        prop_assert!(cipher.decrypt(&URL_SAFE_NO_PAD.encode(&raw)).is_none());
    }

    #[test]
    fn prop_truncation_rejected(
        key in key_strategy(),
        identity in identity_strategy(),
        cut in any::<prop::sample::Index>(),
    ) {
        let cipher = TokenCipher::new(&key, "session").unwrap();
        let token = cipher.encrypt(&identity, false).unwrap();

        let raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let keep = cut.index(raw.len());
        prop_assert!(cipher.decrypt(&URL_SAFE_NO_PAD.encode(&raw[..keep])).is_none());
    }

    #[test]
    fn prop_wrong_key_rejected(
        key_a in key_strategy(),
        key_b in key_strategy(),
        identity in identity_strategy(),
    ) {
        prop_assume!(key_a != key_b);
        let a = TokenCipher::new(&key_a, "session").unwrap();
        let b = TokenCipher::new(&key_b, "session").unwrap();

        let token = a.encrypt(&identity, false).unwrap();
        prop_assert!(b.decrypt(&token).is_none());
    }

    #[test]
    fn prop_deterministic_is_stable_across_instances(
        key in key_strategy(),
        identity in identity_strategy(),
        unique_key in prop::collection::vec(any::<u8>(), 1..32),
    ) {
        let first = TokenCipher::new(&key, "session").unwrap().with_unique_key(unique_key.clone());
        let second = TokenCipher::new(&key, "session").unwrap().with_unique_key(unique_key);

        prop_assert_eq!(
            first.encrypt(&identity, true).unwrap(),
            second.encrypt(&identity, true).unwrap()
        );
    }

    #[test]
    fn prop_garbage_never_panics(input in ".{0,200}") {
        let cipher = TokenCipher::new(&generate_key(), "session").unwrap();
        prop_assert!(cipher.decrypt(&input).is_none());
    }

    #[test]
    fn prop_key_text_roundtrip(key in key_strategy()) {
        let text = format_key(&key);
        prop_assert!(text.starts_with("base64:"));
        prop_assert_eq!(text.len(), "base64:".len() + 44);
        prop_assert_eq!(parse_key(&text).unwrap(), key);
    }
}

#[test]
fn test_random_mode_is_unlinkable() {
    let cipher = TokenCipher::new(&generate_key(), "session")
        .unwrap()
        .with_unique_key(b"dedupe".to_vec());

    let a = cipher.encrypt_str("alice@example.com", false).unwrap();
    let b = cipher.encrypt_str("alice@example.com", false).unwrap();
    assert_ne!(a, b);
    assert_eq!(cipher.decrypt_str(&a), cipher.decrypt_str(&b));
}

#[test]
fn test_deterministic_without_unique_key_falls_back() {
    let cipher = TokenCipher::new(&generate_key(), "session").unwrap();
    assert!(!cipher.supports_deterministic());

    let a = cipher.encrypt_str("alice@example.com", true).unwrap();
    let b = cipher.encrypt_str("alice@example.com", true).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_deterministic_depends_on_unique_key_and_context() {
    let key = generate_key();
    let base = TokenCipher::new(&key, "session")
        .unwrap()
        .with_unique_key(b"one".to_vec());
    let other_unique = TokenCipher::new(&key, "session")
        .unwrap()
        .with_unique_key(b"two".to_vec());
    let other_context = TokenCipher::new(&key, "invite")
        .unwrap()
        .with_unique_key(b"one".to_vec());

    let token = base.encrypt_str("alice@example.com", true).unwrap();
    assert_ne!(token, other_unique.encrypt_str("alice@example.com", true).unwrap());
    assert_ne!(token, other_context.encrypt_str("alice@example.com", true).unwrap());

    // Different unique key, same key and context: still decrypts
    assert_eq!(
        other_unique.decrypt_str(&token).as_deref(),
        Some("alice@example.com")
    );
}

#[test]
fn test_empty_token_rejected() {
    let cipher = TokenCipher::new(&generate_key(), "session").unwrap();
    assert!(cipher.decrypt("").is_none());
}
