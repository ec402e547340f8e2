//! # passgate: Passwordless Sessions
//!
//! passgate issues, validates, rotates and delegates short-lived sessions
//! for a code-based login flow, keeping every session isolated to the API
//! consumer that created it.
//!
//! - **Opaque identity tokens** - XChaCha20-Poly1305 with a context tag
//! - **Code login** - 6-digit codes with a short validity window
//! - **Per-consumer isolation** - a session is reachable only through its API key
//! - **One-level delegation** - hand a validated session to another consumer
//! - **Cascading expiry** - deleting or expiring a parent removes its children
//!
//! ## Quick Start
//!
//! ```ignore
//! use passgate::{SessionEngine, SessionOptions, TokenCipher};
//!
//! let cipher = TokenCipher::new(&passgate::generate_key(), "session")?
//!     .with_unique_key(b"dedupe-key".to_vec());
//! let engine = SessionEngine::in_memory()?;
//!
//! // Stable token so repeated logins land on the same user
//! let token = cipher.encrypt_str("alice@example.com", true)?;
//! engine.find_or_create_user(&token)?;
//!
//! let session = engine.create_session(&token, "keyA", SessionOptions::default())?;
//! // ... deliver session.code out of band ...
//! ```
//!
//! ## Architecture
//!
//! 1. **TokenCipher** (`cipher`) - identity ⇄ opaque token
//! 2. **SessionEngine** (`auth`) - lifecycle and state machine
//! 3. **SessionStore** (`storage`) - SQLite rows with cascading foreign keys
//!
//! The engine never decrypts tokens; the cipher never touches the store.

pub mod auth;
pub mod cipher;
pub mod config;
mod error;
pub mod storage;
mod types;

// Public API exports
pub use auth::{EngineStats, SessionEngine, SessionOptions};
pub use cipher::{CipherError, TokenCipher, format_key, generate_key, parse_key};
pub use config::{CipherConfig, EngineConfig};
pub use error::{SessionError, SessionResult};
pub use types::{
    DEFAULT_CODE_VALIDITY_SECONDS, DEFAULT_SESSION_DURATION_SECONDS, Session, SessionState, User,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::auth::{EngineStats, SessionEngine, SessionOptions};
    pub use crate::cipher::{CipherError, TokenCipher};
    pub use crate::config::{CipherConfig, EngineConfig};
    pub use crate::error::{SessionError, SessionResult};
    pub use crate::types::{Session, SessionState, User};
    pub use chrono::{DateTime, Utc};
}
