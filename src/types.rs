/// Core record types for passgate.
///
/// These are the plain data records handed across the engine boundary.
/// They are owned snapshots, never live handles: re-fetch to observe changes.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default session lifetime in seconds (30 minutes).
pub const DEFAULT_SESSION_DURATION_SECONDS: i64 = 1800;

/// Default validity window of a login code in seconds (5 minutes).
pub const DEFAULT_CODE_VALIDITY_SECONDS: i64 = 300;

/// One upstream identity slot.
///
/// The `token` is produced by [`crate::TokenCipher`] from the upstream
/// identity and is treated by the engine as an opaque key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Opaque identity token (primary key)
    pub token: String,

    /// Last time any session of this user was created, touched or rotated
    pub last_activity_at: DateTime<Utc>,
}

/// One authentication context held by one API consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// 32-character lowercase alphanumeric identifier
    pub session_id: String,

    /// Token of the owning user
    pub user_token: String,

    /// Consumer that created this session. Empty is a valid consumer.
    pub api_key: String,

    /// Six-digit login code. Absent for delegated sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// End of the code's validity window. Absent for delegated sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_valid_until: Option<DateTime<Utc>>,

    /// Session expiry
    pub expires_at: DateTime<Utc>,

    /// Lifetime applied on creation and on each touch, in seconds
    pub session_duration: i64,

    /// Whether the code check has been passed
    pub validated: bool,

    /// When the session row was created
    pub created_at: DateTime<Utc>,

    /// Parent session for delegated sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
}

impl Session {
    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check if the session is expired at the given instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True if this session was spawned by delegation.
    pub fn is_delegated(&self) -> bool {
        self.parent_session_id.is_some()
    }

    /// Lifecycle state of a stored session.
    pub fn state(&self) -> SessionState {
        match (self.validated, self.is_delegated()) {
            (_, true) => SessionState::Delegated,
            (true, false) => SessionState::Validated,
            (false, false) => SessionState::Unvalidated,
        }
    }
}

/// Observable lifecycle states of a session.
///
/// A deleted or expired session has no state: its absence is the terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, waiting for the login code
    Unvalidated,
    /// Code accepted
    Validated,
    /// Spawned from a validated parent for another consumer
    Delegated,
}

impl SessionState {
    /// String representation used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unvalidated => "unvalidated",
            SessionState::Validated => "validated",
            SessionState::Delegated => "delegated",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
