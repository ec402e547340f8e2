//! The session engine.
//!
//! [`SessionEngine`] is the authoritative store and state machine for users
//! and sessions. Every public operation takes the store lock once and runs
//! to completion under it; operations touching more than one row run inside
//! a single SQLite transaction.
//!
//! # Lifecycle
//!
//! ```text
//! create ──► Unvalidated ──(validate_code + validate_session)──► Validated
//!                                                                │
//!                    ┌──────────── create_delegated_session ─────┤
//!                    ▼                                           │
//!               Delegated                          rotate ──► Validated (new id)
//!
//! any state ──(delete / expiry)──► gone, together with every delegated child
//! ```
//!
//! # Expiry
//!
//! A session's absence is its expired state. Reads delete rows they find
//! expired, and [`SessionEngine::delete_expired_sessions`] sweeps the rest.
//! Delegated sessions are checked against their parent on read, so a child
//! is never reachable once its parent is expired.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::delegation::{check_delegable, delegated_child};
use crate::auth::session::{generate_code, generate_session_id};
use crate::auth::verification::verify_code;
use crate::config::EngineConfig;
use crate::error::{SessionError, SessionResult};
use crate::storage::{self, SessionStore, checked_offset, normalize};
use crate::types::{Session, User};

/// Per-call overrides for [`SessionEngine::create_session`].
///
/// Unset durations fall back to the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Session lifetime in seconds
    pub duration_seconds: Option<i64>,

    /// Code validity window in seconds
    pub code_validity_seconds: Option<i64>,

    /// Session being rotated out by this creation
    pub replace_session_id: Option<String>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duration(mut self, seconds: i64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn code_validity(mut self, seconds: i64) -> Self {
        self.code_validity_seconds = Some(seconds);
        self
    }

    /// Rotate: the new session takes over `session_id`'s children and the
    /// old row is deleted.
    pub fn replacing(mut self, session_id: impl Into<String>) -> Self {
        self.replace_session_id = Some(session_id.into());
        self
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub users: usize,
    pub sessions: usize,
    pub sessions_created: u64,
    pub sessions_rotated: u64,
    pub sessions_delegated: u64,
    pub codes_accepted: u64,
    pub codes_rejected: u64,
    pub sessions_swept: u64,
}

/// Authoritative store and state machine for users and sessions.
///
/// Construct once at startup and share by reference (or `Arc`); there is
/// no global instance.
#[derive(Debug)]
pub struct SessionEngine {
    store: SessionStore,
    config: EngineConfig,

    sessions_created: AtomicU64,
    sessions_rotated: AtomicU64,
    sessions_delegated: AtomicU64,
    codes_accepted: AtomicU64,
    codes_rejected: AtomicU64,
    sessions_swept: AtomicU64,
}

impl SessionEngine {
    /// Open an engine with the given configuration.
    ///
    /// The configuration is validated once here.
    pub fn open(config: EngineConfig) -> SessionResult<Self> {
        config.validate()?;

        let store = match &config.database_path {
            Some(path) => SessionStore::open(path)?,
            None => SessionStore::open_in_memory()?,
        };

        Ok(Self::with_store(store, config))
    }

    /// Open an in-memory engine with default configuration.
    pub fn in_memory() -> SessionResult<Self> {
        Self::open(EngineConfig::in_memory())
    }

    /// Wrap an already opened store.
    pub fn with_store(store: SessionStore, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            sessions_created: AtomicU64::new(0),
            sessions_rotated: AtomicU64::new(0),
            sessions_delegated: AtomicU64::new(0),
            codes_accepted: AtomicU64::new(0),
            codes_rejected: AtomicU64::new(0),
            sessions_swept: AtomicU64::new(0),
        }
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Create a user for an opaque identity token.
    pub fn create_user(&self, token: &str) -> SessionResult<User> {
        if token.is_empty() {
            return Err(SessionError::EmptyToken);
        }

        let conn = self.store.lock()?;
        if storage::user_exists(&conn, token)? {
            return Err(SessionError::UserExists);
        }

        let user = User {
            token: token.to_string(),
            last_activity_at: now(),
        };
        storage::insert_user(&conn, &user)?;
        Ok(user)
    }

    /// Fetch the user for `token`, creating it on first login.
    pub fn find_or_create_user(&self, token: &str) -> SessionResult<User> {
        if token.is_empty() {
            return Err(SessionError::EmptyToken);
        }

        let conn = self.store.lock()?;
        if let Some(user) = storage::get_user(&conn, token)? {
            return Ok(user);
        }

        let user = User {
            token: token.to_string(),
            last_activity_at: now(),
        };
        storage::insert_user(&conn, &user)?;
        Ok(user)
    }

    pub fn get_user(&self, token: &str) -> SessionResult<Option<User>> {
        let conn = self.store.lock()?;
        storage::get_user(&conn, token)
    }

    /// Delete a user and, through the cascade, all of its sessions.
    pub fn delete_user(&self, token: &str) -> SessionResult<bool> {
        let conn = self.store.lock()?;
        storage::delete_user(&conn, token)
    }

    // ========================================================================
    // Session creation and rotation
    // ========================================================================

    /// Create an unvalidated session with a fresh code.
    ///
    /// With [`SessionOptions::replacing`], the replaced session's children are
    /// moved under the new session and the replaced row is deleted, all in
    /// one transaction. The replaced session must belong to the same user.
    /// An expired replaced session is removed with its children and nothing
    /// is moved.
    pub fn create_session(
        &self,
        user_token: &str,
        api_key: &str,
        options: SessionOptions,
    ) -> SessionResult<Session> {
        if user_token.is_empty() {
            return Err(SessionError::EmptyToken);
        }
        let duration = self.session_duration(options.duration_seconds)?;
        let code_validity = self.code_validity(options.code_validity_seconds)?;
        let now = now();

        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;

        if !storage::user_exists(&tx, user_token)? {
            return Err(SessionError::UserNotFound);
        }

        let replaced = match options.replace_session_id.as_deref() {
            Some(old_id) => load_live(&tx, old_id, now)?,
            None => None,
        };
        if let Some(old) = &replaced {
            if old.user_token != user_token {
                warn!(
                    session_id = %old.session_id,
                    "Refusing to replace a session of another user"
                );
                return Err(SessionError::SessionNotFound(old.session_id.clone()));
            }
        }

        let session = Session {
            session_id: fresh_session_id(&tx)?,
            user_token: user_token.to_string(),
            api_key: api_key.to_string(),
            code: Some(generate_code()),
            code_valid_until: Some(checked_offset(now, code_validity)?),
            expires_at: checked_offset(now, duration)?,
            session_duration: duration,
            validated: false,
            created_at: now,
            parent_session_id: None,
        };
        storage::insert_session(&tx, &session)?;

        if let Some(old) = &replaced {
            let old_id = old.session_id.as_str();
            let moved = storage::reparent_children(&tx, old_id, &session.session_id)?;
            storage::delete_session(&tx, old_id)?;
            self.sessions_rotated.fetch_add(1, Ordering::Relaxed);
            debug!(
                old_session_id = %old_id,
                session_id = %session.session_id,
                children = moved,
                "Session replaced"
            );
        }

        storage::touch_user(&tx, user_token, now)?;
        tx.commit()?;

        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %session.session_id, "Session created");
        Ok(session)
    }

    /// Give a live session a new id.
    ///
    /// The new session keeps the user, consumer, lifetime, validation state
    /// and parent link of the old one, starts a fresh lifetime from now, and
    /// adopts the old session's children. Undelegated sessions also receive
    /// a fresh code so the old one cannot be replayed.
    pub fn rotate_session(&self, session_id: &str) -> SessionResult<Session> {
        let now = now();
        let code_validity = self.config.default_code_validity_seconds;

        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;

        let old = load_live(&tx, session_id, now)?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;

        let delegated = old.is_delegated();
        let session = Session {
            session_id: fresh_session_id(&tx)?,
            user_token: old.user_token.clone(),
            api_key: old.api_key.clone(),
            code: (!delegated).then(generate_code),
            code_valid_until: if delegated {
                None
            } else {
                Some(checked_offset(now, code_validity)?)
            },
            expires_at: checked_offset(now, old.session_duration)?,
            session_duration: old.session_duration,
            validated: old.validated,
            created_at: now,
            parent_session_id: old.parent_session_id.clone(),
        };
        storage::insert_session(&tx, &session)?;
        let moved = storage::reparent_children(&tx, session_id, &session.session_id)?;
        storage::delete_session(&tx, session_id)?;
        storage::touch_user(&tx, &session.user_token, now)?;
        tx.commit()?;

        self.sessions_rotated.fetch_add(1, Ordering::Relaxed);
        debug!(
            old_session_id = %session_id,
            session_id = %session.session_id,
            children = moved,
            "Session rotated"
        );
        Ok(session)
    }

    // ========================================================================
    // Keep-alive and validation
    // ========================================================================

    /// Extend a session's lifetime from now without changing its id.
    ///
    /// Returns `None` if the session does not exist or has expired.
    pub fn touch_session(
        &self,
        session_id: &str,
        new_duration_seconds: i64,
    ) -> SessionResult<Option<Session>> {
        self.touch_session_at(session_id, new_duration_seconds, Utc::now())
    }

    /// [`SessionEngine::touch_session`] at an explicit instant.
    pub fn touch_session_at(
        &self,
        session_id: &str,
        new_duration_seconds: i64,
        now: DateTime<Utc>,
    ) -> SessionResult<Option<Session>> {
        let duration = self.session_duration(Some(new_duration_seconds))?;
        let now = normalize(now);

        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;

        let Some(mut session) = load_live(&tx, session_id, now)? else {
            tx.commit()?;
            return Ok(None);
        };

        session.expires_at = checked_offset(now, duration)?;
        session.session_duration = duration;
        storage::update_expiry(&tx, session_id, session.expires_at, duration)?;
        storage::touch_user(&tx, &session.user_token, now)?;
        tx.commit()?;

        Ok(Some(session))
    }

    /// Check a submitted login code.
    ///
    /// True iff the session exists, is live, the code matches exactly and
    /// the code window is still open.
    pub fn validate_code(&self, session_id: &str, code: &str) -> SessionResult<bool> {
        self.validate_code_at(session_id, code, Utc::now())
    }

    /// [`SessionEngine::validate_code`] at an explicit instant.
    pub fn validate_code_at(
        &self,
        session_id: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> SessionResult<bool> {
        let conn = self.store.lock()?;

        let accepted = match load_live(&conn, session_id, now)? {
            Some(session) => verify_code(&session, code, now),
            None => false,
        };

        if accepted {
            self.codes_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.codes_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %session_id, "Code rejected");
        }
        Ok(accepted)
    }

    /// Mark a session validated. Idempotent.
    ///
    /// Returns false if the session does not exist or has expired.
    pub fn validate_session(&self, session_id: &str) -> SessionResult<bool> {
        let conn = self.store.lock()?;
        if load_live(&conn, session_id, Utc::now())?.is_none() {
            return Ok(false);
        }
        storage::mark_validated(&conn, session_id)
    }

    /// Replace a session's code and code window.
    ///
    /// Used right after a successful validation so the consumed code cannot
    /// be replayed. Delegated sessions carry no code and are returned as is.
    pub fn regenerate_session_code(
        &self,
        session_id: &str,
        code_validity_seconds: Option<i64>,
    ) -> SessionResult<Option<Session>> {
        let code_validity = self.code_validity(code_validity_seconds)?;
        let now = now();

        let conn = self.store.lock()?;
        let Some(mut session) = load_live(&conn, session_id, now)? else {
            return Ok(None);
        };
        if session.is_delegated() {
            return Ok(Some(session));
        }

        let code = generate_code();
        let valid_until = checked_offset(now, code_validity)?;
        storage::update_code(&conn, session_id, &code, valid_until)?;

        session.code = Some(code);
        session.code_valid_until = Some(valid_until);
        Ok(Some(session))
    }

    // ========================================================================
    // Reads and isolation
    // ========================================================================

    /// Fetch a live session. Expired rows found here are deleted.
    pub fn get_session(&self, session_id: &str) -> SessionResult<Option<Session>> {
        self.get_session_at(session_id, Utc::now())
    }

    /// [`SessionEngine::get_session`] at an explicit instant.
    pub fn get_session_at(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> SessionResult<Option<Session>> {
        let conn = self.store.lock()?;
        load_live(&conn, session_id, now)
    }

    /// True iff the session exists and has not expired.
    pub fn is_session_active(&self, session_id: &str) -> SessionResult<bool> {
        self.is_session_active_at(session_id, Utc::now())
    }

    /// [`SessionEngine::is_session_active`] at an explicit instant.
    pub fn is_session_active_at(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> SessionResult<bool> {
        Ok(self.get_session_at(session_id, now)?.is_some())
    }

    /// The isolation boundary between consumers.
    ///
    /// True iff the session is live and was created by exactly `api_key`.
    /// Callers must pass this check before exposing any other session
    /// operation to a consumer.
    pub fn check_session_access(&self, session_id: &str, api_key: &str) -> SessionResult<bool> {
        Ok(self
            .get_session(session_id)?
            .is_some_and(|session| session.api_key == api_key))
    }

    /// Live sessions of a user, oldest first.
    pub fn list_user_sessions(&self, user_token: &str) -> SessionResult<Vec<Session>> {
        let now = now();
        let conn = self.store.lock()?;
        let sessions = storage::list_user_sessions(&conn, user_token)?;

        let expired: Vec<&str> = sessions
            .iter()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.session_id.as_str())
            .collect();

        Ok(sessions
            .iter()
            .filter(|s| {
                !expired.contains(&s.session_id.as_str())
                    && !s
                        .parent_session_id
                        .as_deref()
                        .is_some_and(|parent| expired.contains(&parent))
            })
            .cloned()
            .collect())
    }

    /// Live delegated children of a live parent.
    pub fn list_delegated_sessions(&self, parent_session_id: &str) -> SessionResult<Vec<Session>> {
        let now = now();
        let conn = self.store.lock()?;
        if load_live(&conn, parent_session_id, now)?.is_none() {
            return Ok(Vec::new());
        }

        Ok(storage::list_children(&conn, parent_session_id)?
            .into_iter()
            .filter(|child| !child.is_expired_at(now))
            .collect())
    }

    /// Number of stored session rows, expired or not.
    pub fn count_sessions(&self) -> SessionResult<usize> {
        let conn = self.store.lock()?;
        storage::count_sessions(&conn)
    }

    // ========================================================================
    // Delegation
    // ========================================================================

    /// Spawn a validated child session for another consumer.
    ///
    /// # Errors
    /// - [`SessionError::SessionNotFound`] if the parent is absent or expired
    /// - [`SessionError::NestedDelegation`] if the parent is itself delegated
    /// - [`SessionError::ParentNotValidated`] if the parent has not passed the code check
    pub fn create_delegated_session(
        &self,
        parent_session_id: &str,
        target_api_key: &str,
        duration_seconds: Option<i64>,
    ) -> SessionResult<Session> {
        let duration = self.session_duration(duration_seconds)?;
        let now = now();

        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;

        let parent = load_live(&tx, parent_session_id, now)?
            .ok_or_else(|| SessionError::SessionNotFound(parent_session_id.to_string()))?;

        if let Err(err) = check_delegable(&parent) {
            warn!(session_id = %parent_session_id, error = %err, "Delegation refused");
            return Err(err);
        }

        let child = delegated_child(
            &parent,
            fresh_session_id(&tx)?,
            target_api_key,
            duration,
            now,
        )?;
        storage::insert_session(&tx, &child)?;
        storage::touch_user(&tx, &child.user_token, now)?;
        tx.commit()?;

        self.sessions_delegated.fetch_add(1, Ordering::Relaxed);
        debug!(
            parent_session_id = %parent_session_id,
            session_id = %child.session_id,
            "Session delegated"
        );
        Ok(child)
    }

    // ========================================================================
    // Deletion and maintenance
    // ========================================================================

    /// Delete a session and every session delegated from it.
    pub fn delete_session(&self, session_id: &str) -> SessionResult<bool> {
        let conn = self.store.lock()?;
        let deleted = storage::delete_session(&conn, session_id)?;
        if deleted {
            debug!(session_id = %session_id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Delete all sessions of a user. Returns the number of rows removed.
    pub fn delete_user_sessions(&self, user_token: &str) -> SessionResult<usize> {
        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;

        let before = storage::count_sessions(&tx)?;
        storage::delete_user_sessions(&tx, user_token)?;
        let after = storage::count_sessions(&tx)?;
        tx.commit()?;

        Ok(before - after)
    }

    /// Delete sessions expired at `before` (default: now), with their children.
    ///
    /// Returns the number of rows removed, cascaded children included.
    pub fn delete_expired_sessions(&self, before: Option<DateTime<Utc>>) -> SessionResult<usize> {
        let before = before.map(normalize).unwrap_or_else(now);

        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;

        let count_before = storage::count_sessions(&tx)?;
        storage::delete_expired(&tx, before)?;
        let count_after = storage::count_sessions(&tx)?;
        tx.commit()?;

        let removed = count_before - count_after;
        if removed > 0 {
            self.sessions_swept.fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, "Expired sessions swept");
        }
        Ok(removed)
    }

    /// Get engine statistics.
    pub fn stats(&self) -> SessionResult<EngineStats> {
        let conn = self.store.lock()?;
        Ok(EngineStats {
            users: storage::count_users(&conn)?,
            sessions: storage::count_sessions(&conn)?,
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_rotated: self.sessions_rotated.load(Ordering::Relaxed),
            sessions_delegated: self.sessions_delegated.load(Ordering::Relaxed),
            codes_accepted: self.codes_accepted.load(Ordering::Relaxed),
            codes_rejected: self.codes_rejected.load(Ordering::Relaxed),
            sessions_swept: self.sessions_swept.load(Ordering::Relaxed),
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn session_duration(&self, requested: Option<i64>) -> SessionResult<i64> {
        let seconds = requested.unwrap_or(self.config.default_session_duration_seconds);
        if seconds <= 0 {
            return Err(SessionError::InvalidDuration(seconds));
        }
        Ok(seconds.min(self.config.max_session_duration_seconds))
    }

    fn code_validity(&self, requested: Option<i64>) -> SessionResult<i64> {
        let seconds = requested.unwrap_or(self.config.default_code_validity_seconds);
        if seconds <= 0 {
            return Err(SessionError::InvalidDuration(seconds));
        }
        Ok(seconds.min(self.config.max_code_validity_seconds))
    }
}

fn now() -> DateTime<Utc> {
    normalize(Utc::now())
}

/// Allocate a session id not yet present in the store.
fn fresh_session_id(conn: &Connection) -> SessionResult<String> {
    loop {
        let candidate = generate_session_id();
        if !storage::session_exists(conn, &candidate)? {
            return Ok(candidate);
        }
        warn!("Session id collision, regenerating");
    }
}

/// Load a session if it is live at `now`.
///
/// An expired session is deleted on the spot. A delegated session whose
/// parent is expired takes the parent (and so itself) down with it.
fn load_live(
    conn: &Connection,
    session_id: &str,
    now: DateTime<Utc>,
) -> SessionResult<Option<Session>> {
    let Some(session) = storage::get_session(conn, session_id)? else {
        return Ok(None);
    };

    if session.is_expired_at(now) {
        debug!(session_id = %session_id, "Expired session removed on read");
        storage::delete_session(conn, session_id)?;
        return Ok(None);
    }

    if let Some(parent_id) = session.parent_session_id.as_deref() {
        match storage::get_session(conn, parent_id)? {
            Some(parent) if !parent.is_expired_at(now) => {}
            _ => {
                debug!(
                    session_id = %session_id,
                    parent_session_id = %parent_id,
                    "Parent expired, removing delegated session"
                );
                storage::delete_session(conn, parent_id)?;
                storage::delete_session(conn, session_id)?;
                return Ok(None);
            }
        }
    }

    Ok(Some(session))
}
