//! Login code verification.
//!
//! A code is accepted only while its validity window is open and only on an
//! exact match. The comparison runs through an HMAC tag check so its timing
//! does not depend on how many leading characters match.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::types::Session;

type HmacSha256 = Hmac<Sha256>;

/// Compare two codes in constant time.
pub fn codes_match(expected: &str, submitted: &str) -> bool {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);

    let Ok(mut submitted_mac) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    submitted_mac.update(submitted.as_bytes());
    let submitted_tag = submitted_mac.finalize().into_bytes();

    let Ok(mut expected_mac) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    expected_mac.update(expected.as_bytes());
    expected_mac.verify_slice(&submitted_tag).is_ok()
}

/// Whether the session's code window is still open at `now`.
pub fn code_window_open(session: &Session, now: DateTime<Utc>) -> bool {
    session
        .code_valid_until
        .is_some_and(|valid_until| now < valid_until)
}

/// Verify a submitted code against a session at `now`.
///
/// Delegated sessions carry no code and never verify.
pub fn verify_code(session: &Session, submitted: &str, now: DateTime<Utc>) -> bool {
    match session.code.as_deref() {
        Some(expected) => code_window_open(session, now) && codes_match(expected, submitted),
        None => false,
    }
}
