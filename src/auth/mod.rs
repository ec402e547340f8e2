//! Code-based sessions with per-consumer isolation and delegation.
//!
//! This module implements the session lifecycle for a passwordless login
//! flow. An upstream identity is turned into an opaque token by
//! [`crate::TokenCipher`]; everything here treats that token as an opaque
//! key and never decrypts it.
//!
//! # Core Concepts
//!
//! ## Users
//! A user is one identity slot, keyed by its opaque token. Users are created
//! lazily on first login and carry only a last-activity timestamp.
//!
//! ## Code Login
//! 1. The consumer asks for a session for a user
//! 2. The engine creates an unvalidated session with a 6-digit code (5 minute window)
//! 3. The code is delivered out of band and submitted back
//! 4. The engine checks the code and marks the session validated
//! 5. The consumer regenerates the code so the used one cannot be replayed
//!
//! ## Isolation
//! A session belongs to the API key that created it. The empty key is a
//! consumer like any other. [`SessionEngine::check_session_access`] is the
//! only isolation boundary and must gate every consumer-facing operation.
//!
//! ## Delegation
//! A validated session may spawn one level of child sessions for other
//! consumers. Children are validated from birth and have no code. Deleting
//! or expiring a parent removes its children.
//!
//! ## Touch vs. Rotate
//! [`SessionEngine::touch_session`] extends a session and keeps its id.
//! [`SessionEngine::rotate_session`] (or `create_session` with
//! [`SessionOptions::replacing`]) issues a new id and moves any children
//! over. The two are never merged.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use passgate::auth::{SessionEngine, SessionOptions};
//!
//! let engine = SessionEngine::in_memory()?;
//! engine.find_or_create_user(&token)?;
//!
//! let session = engine.create_session(&token, "keyA", SessionOptions::default())?;
//! if engine.validate_code(&session.session_id, &submitted)? {
//!     engine.validate_session(&session.session_id)?;
//!     engine.regenerate_session_code(&session.session_id, None)?;
//! }
//!
//! let child = engine.create_delegated_session(&session.session_id, "keyB", None)?;
//! ```

mod delegation;
mod manager;
mod session;
mod verification;

pub use delegation::{check_delegable, delegated_child};
pub use manager::{EngineStats, SessionEngine, SessionOptions};
pub use session::{
    CODE_LENGTH, SESSION_ID_ALPHABET, SESSION_ID_LENGTH, generate_code, generate_session_id,
    is_code, is_session_id,
};
pub use verification::{code_window_open, codes_match, verify_code};
