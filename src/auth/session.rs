//! Session identifiers and login codes.
//!
//! Both are drawn from the OS RNG with uniform sampling, so neither the id
//! alphabet nor the code range carries modulo bias.

use rand::Rng;
use rand::rngs::OsRng;

/// Length of a session id in characters.
pub const SESSION_ID_LENGTH: usize = 32;

/// Alphabet session ids are drawn from.
pub const SESSION_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Number of digits in a login code.
pub const CODE_LENGTH: usize = 6;

const CODE_SPACE: u32 = 1_000_000;

/// Generate a fresh session id.
///
/// 32 characters over a 36-symbol alphabet gives about 165 bits of entropy.
pub fn generate_session_id() -> String {
    let mut rng = OsRng;
    (0..SESSION_ID_LENGTH)
        .map(|_| char::from(SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())]))
        .collect()
}

/// Generate a six-digit login code, zero padded.
pub fn generate_code() -> String {
    let value = OsRng.gen_range(0..CODE_SPACE);
    format!("{value:0width$}", width = CODE_LENGTH)
}

/// Check that a string has the shape of a session id.
pub fn is_session_id(candidate: &str) -> bool {
    candidate.len() == SESSION_ID_LENGTH
        && candidate.bytes().all(|b| SESSION_ID_ALPHABET.contains(&b))
}

/// Check that a string has the shape of a login code.
pub fn is_code(candidate: &str) -> bool {
    candidate.len() == CODE_LENGTH && candidate.bytes().all(|b| b.is_ascii_digit())
}
