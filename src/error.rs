/// Error types for passgate session operations.
///
/// Errors fall into two families that callers must be able to tell apart:
/// domain outcomes (a session that does not exist, a nested delegation) and
/// infrastructure failures (the store is unreachable or holds data we cannot
/// decode). Both are variants of [`SessionError`]; use
/// [`SessionError::is_domain`] to branch on the family.
use thiserror::Error;

/// The main error type for session engine operations.
///
/// All fallible operations on [`crate::SessionEngine`] return
/// `Result<T, SessionError>`.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A user token was required but an empty string was given
    #[error("token cannot be empty")]
    EmptyToken,

    /// A user with this token is already stored
    #[error("user already exists")]
    UserExists,

    /// No user is stored under the given token
    #[error("user not found")]
    UserNotFound,

    /// The session does not exist or has already expired
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// Delegation was requested from a session that has not passed the code check
    #[error("session '{0}' is not validated")]
    ParentNotValidated(String),

    /// Delegation was requested from a session that is itself delegated
    #[error("cannot delegate from a child session")]
    NestedDelegation,

    /// A duration or validity window was zero or negative
    #[error("invalid duration: {0} seconds")]
    InvalidDuration(i64),

    /// The backing store rejected or failed an operation
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A stored row could not be decoded into a record
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// The store handle was poisoned by a panic in another caller
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Configuration was rejected at startup
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// True for expected, named outcomes of a well-formed request.
    ///
    /// Everything else is an infrastructure failure and should be surfaced
    /// as such, never mapped to "not found".
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            SessionError::EmptyToken
                | SessionError::UserExists
                | SessionError::UserNotFound
                | SessionError::SessionNotFound(_)
                | SessionError::ParentNotValidated(_)
                | SessionError::NestedDelegation
                | SessionError::InvalidDuration(_)
        )
    }

    /// Opposite of [`SessionError::is_domain`].
    pub fn is_infrastructure(&self) -> bool {
        !self.is_domain()
    }
}

/// Result type alias for session engine operations.
pub type SessionResult<T> = Result<T, SessionError>;
