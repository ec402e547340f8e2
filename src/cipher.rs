//! Opaque identity tokens via XChaCha20-Poly1305.
//!
//! A [`TokenCipher`] turns an upstream identity (an email address, a
//! directory id, any short byte string) into a URL-safe token that reveals
//! nothing to its holder, and recovers the identity from such a token.
//!
//! # Token Format
//!
//! ```text
//! base64url_nopad( nonce (24 bytes) || ciphertext || tag (16 bytes) )
//! ```
//!
//! The cipher's context string is bound as associated data, so a token
//! minted under one context never opens under another even with the same
//! key.
//!
//! # Nonce Strategies
//!
//! - **Random** (default): a fresh nonce from the OS RNG on each call. Two
//!   encryptions of the same identity are unlinkable.
//! - **Deterministic**: when the cipher holds a unique key, the nonce is
//!   derived with HKDF-SHA256 keyed by the unique key over the identity, so
//!   the same identity always yields the same token. Without a unique key a
//!   deterministic request falls back to a random nonce.
//!
//! Decryption never reports *why* it failed. Malformed input, wrong key,
//! wrong context and tampering all yield `None`.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

/// Size of cipher keys in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of XChaCha20 nonces in bytes.
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Prefix of the conventional textual key form.
pub const KEY_PREFIX: &str = "base64:";

const NONCE_INFO_PREFIX: &[u8] = b"passgate:token-nonce:v1|";

/// Key configuration and encryption errors.
///
/// Decryption failures are deliberately absent: see [`TokenCipher::decrypt`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("Invalid key length: expected {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid key encoding")]
    InvalidKeyEncoding,

    #[error("Encryption failure")]
    Encryption,
}

/// AEAD wrapper producing opaque identity tokens.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: XChaCha20Poly1305,
    context: String,
    unique_key: Option<Vec<u8>>,
}

impl TokenCipher {
    /// Create a cipher from a 32-byte key and a context string.
    ///
    /// # Errors
    /// Returns [`CipherError::InvalidKeyLength`] unless `key` is exactly
    /// [`KEY_SIZE`] bytes.
    pub fn new(key: &[u8], context: impl Into<String>) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKeyLength(key.len()));
        }

        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            context: context.into(),
            unique_key: None,
        })
    }

    /// Supply the unique key that enables deterministic tokens.
    ///
    /// An empty unique key is ignored.
    pub fn with_unique_key(mut self, unique_key: impl Into<Vec<u8>>) -> Self {
        let unique_key = unique_key.into();
        self.unique_key = (!unique_key.is_empty()).then_some(unique_key);
        self
    }

    /// The context bound into every token as associated data.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Whether deterministic encryption is available.
    pub fn supports_deterministic(&self) -> bool {
        self.unique_key.is_some()
    }

    /// Encrypt an identity into a URL-safe token.
    ///
    /// # Errors
    /// Returns [`CipherError::Encryption`] only if the AEAD refuses the
    /// input, which does not happen for identity-sized payloads.
    pub fn encrypt(&self, identity: &[u8], deterministic: bool) -> Result<String, CipherError> {
        let nonce_bytes = match (&self.unique_key, deterministic) {
            (Some(unique_key), true) => self.derive_nonce(unique_key, identity)?,
            _ => random_nonce(),
        };

        let payload = Payload {
            msg: identity,
            aad: self.context.as_bytes(),
        };
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| CipherError::Encryption)?;

        let mut token = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    /// Recover the identity from a token.
    ///
    /// Returns `None` for every kind of failure.
    pub fn decrypt(&self, token: &str) -> Option<Vec<u8>> {
        let data = URL_SAFE_NO_PAD.decode(token).ok()?;
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return None;
        }

        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        let payload = Payload {
            msg: ciphertext,
            aad: self.context.as_bytes(),
        };
        self.cipher.decrypt(XNonce::from_slice(nonce), payload).ok()
    }

    /// Encrypt a UTF-8 identity.
    pub fn encrypt_str(&self, identity: &str, deterministic: bool) -> Result<String, CipherError> {
        self.encrypt(identity.as_bytes(), deterministic)
    }

    /// Decrypt a token whose identity is UTF-8 text.
    pub fn decrypt_str(&self, token: &str) -> Option<String> {
        self.decrypt(token)
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    fn derive_nonce(
        &self,
        unique_key: &[u8],
        identity: &[u8],
    ) -> Result<[u8; NONCE_SIZE], CipherError> {
        let hkdf = Hkdf::<Sha256>::new(Some(unique_key), identity);

        let mut info = Vec::with_capacity(NONCE_INFO_PREFIX.len() + self.context.len());
        info.extend_from_slice(NONCE_INFO_PREFIX);
        info.extend_from_slice(self.context.as_bytes());

        let mut nonce = [0u8; NONCE_SIZE];
        hkdf.expand(&info, &mut nonce)
            .map_err(|_| CipherError::Encryption)?;
        Ok(nonce)
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("context", &self.context)
            .field("deterministic", &self.supports_deterministic())
            .finish_non_exhaustive()
    }
}

/// Generate fresh key material from the OS RNG.
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Parse a key in `base64:<44 chars>` form.
///
/// The prefix is optional; the body is standard padded base64.
pub fn parse_key(encoded: &str) -> Result<[u8; KEY_SIZE], CipherError> {
    let body = encoded.trim();
    let body = body.strip_prefix(KEY_PREFIX).unwrap_or(body);

    let bytes = STANDARD
        .decode(body)
        .map_err(|_| CipherError::InvalidKeyEncoding)?;

    <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
        .map_err(|_| CipherError::InvalidKeyLength(bytes.len()))
}

/// Format a key in `base64:<44 chars>` form.
pub fn format_key(key: &[u8; KEY_SIZE]) -> String {
    format!("{KEY_PREFIX}{}", STANDARD.encode(key))
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
