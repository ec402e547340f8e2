//! Delegation rules.
//!
//! A validated, top-level session may spawn a child session for another
//! consumer without a new code challenge. Children are born validated, carry
//! no code, and can never delegate further.

use chrono::{DateTime, Utc};

use crate::error::{SessionError, SessionResult};
use crate::storage::checked_offset;
use crate::types::Session;

/// Check that `parent` may delegate.
///
/// A nested delegation is reported before a missing validation, so a child
/// session always gets the distinct nested-delegation error.
pub fn check_delegable(parent: &Session) -> SessionResult<()> {
    if parent.is_delegated() {
        return Err(SessionError::NestedDelegation);
    }
    if !parent.validated {
        return Err(SessionError::ParentNotValidated(parent.session_id.clone()));
    }
    Ok(())
}

/// Build the child record for a delegation.
///
/// Fails with [`SessionError::InvalidDuration`] if the expiry cannot be
/// represented.
pub fn delegated_child(
    parent: &Session,
    session_id: String,
    target_api_key: &str,
    duration_seconds: i64,
    now: DateTime<Utc>,
) -> SessionResult<Session> {
    Ok(Session {
        session_id,
        user_token: parent.user_token.clone(),
        api_key: target_api_key.to_string(),
        code: None,
        code_valid_until: None,
        expires_at: checked_offset(now, duration_seconds)?,
        session_duration: duration_seconds,
        validated: true,
        created_at: now,
        parent_session_id: Some(parent.session_id.clone()),
    })
}
