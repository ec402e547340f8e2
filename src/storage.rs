/// SQLite-backed storage for users and sessions.
///
/// This module owns the persisted layout and nothing else: it knows how to
/// read and write rows, but not what a valid lifecycle transition is. The
/// [`crate::SessionEngine`] composes these row operations into atomic
/// lifecycle operations.
///
/// ## Layout
///
/// - `users(token PK, last_activity_at)`
/// - `sessions(session_id PK, user_token FK, api_key, code, code_valid_until,
///   expires_at, session_duration, validated, created_at, parent_session_id FK)`
///
/// Both foreign keys cascade on delete, so removing a user removes its
/// sessions and removing a session removes its delegated children.
///
/// ## Timestamps
///
/// Timestamps are stored as RFC 3339 UTC text with fixed microsecond
/// precision. Fixed width keeps lexical order equal to time order, which
/// the expiry sweep relies on. That holds for years 0 through 9999 only;
/// `checked_offset` refuses to produce anything later.
///
/// ## Thread Safety
///
/// A single connection is shared behind a mutex. Every engine operation
/// holds the lock for its whole duration, which serializes access to the
/// store and makes each operation atomic with respect to the others.
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Datelike, Duration, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{SessionError, SessionResult};
use crate::types::{Session, User};

/// Current schema version, recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    token            TEXT PRIMARY KEY NOT NULL,
    last_activity_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id        TEXT PRIMARY KEY NOT NULL,
    user_token        TEXT NOT NULL REFERENCES users(token) ON DELETE CASCADE,
    api_key           TEXT NOT NULL,
    code              TEXT,
    code_valid_until  TEXT,
    expires_at        TEXT NOT NULL,
    session_duration  INTEGER NOT NULL DEFAULT 1800,
    validated         INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    parent_session_id TEXT REFERENCES sessions(session_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_token ON sessions(user_token);
CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);
CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at);
";

const SESSION_COLUMNS: &str = "session_id, user_token, api_key, code, code_valid_until, \
     expires_at, session_duration, validated, created_at, parent_session_id";

/// Handle to the users/sessions database.
#[derive(Debug)]
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) a file-backed store.
    pub fn open(path: &Path) -> SessionResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SessionError::Config(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init(conn)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> SessionResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SessionResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;

        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(SessionError::Config(format!(
                "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }

        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection for the duration of one operation.
    pub(crate) fn lock(&self) -> SessionResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SessionError::LockPoisoned)
    }
}

// ============================================================================
// Timestamp encoding
// ============================================================================

/// Last calendar year whose timestamps encode at fixed width.
pub const MAX_STORED_YEAR: i32 = 9999;

/// `now + seconds`, or `InvalidDuration` if the result overflows or falls
/// outside the storable range.
pub(crate) fn checked_offset(now: DateTime<Utc>, seconds: i64) -> SessionResult<DateTime<Utc>> {
    Duration::try_seconds(seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .filter(|ts| ts.year() <= MAX_STORED_YEAR)
        .ok_or(SessionError::InvalidDuration(seconds))
}

/// Truncate to the precision the store keeps.
pub(crate) fn normalize(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(column: &str, raw: &str) -> SessionResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SessionError::Corrupt(format!("{column} '{raw}': {e}")))
}

// ============================================================================
// Row decoding
// ============================================================================

/// Raw session row as stored, before timestamp decoding.
struct SessionRow {
    session_id: String,
    user_token: String,
    api_key: String,
    code: Option<String>,
    code_valid_until: Option<String>,
    expires_at: String,
    session_duration: i64,
    validated: bool,
    created_at: String,
    parent_session_id: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            user_token: row.get(1)?,
            api_key: row.get(2)?,
            code: row.get(3)?,
            code_valid_until: row.get(4)?,
            expires_at: row.get(5)?,
            session_duration: row.get(6)?,
            validated: row.get(7)?,
            created_at: row.get(8)?,
            parent_session_id: row.get(9)?,
        })
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = SessionError;

    fn try_from(row: SessionRow) -> SessionResult<Self> {
        let code_valid_until = row
            .code_valid_until
            .as_deref()
            .map(|raw| decode_ts("code_valid_until", raw))
            .transpose()?;

        Ok(Session {
            expires_at: decode_ts("expires_at", &row.expires_at)?,
            created_at: decode_ts("created_at", &row.created_at)?,
            code_valid_until,
            session_id: row.session_id,
            user_token: row.user_token,
            api_key: row.api_key,
            code: row.code,
            session_duration: row.session_duration,
            validated: row.validated,
            parent_session_id: row.parent_session_id,
        })
    }
}

fn collect_sessions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> SessionResult<Vec<Session>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, SessionRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(Session::try_from).collect()
}

// ============================================================================
// User rows
// ============================================================================

pub(crate) fn insert_user(conn: &Connection, user: &User) -> SessionResult<()> {
    conn.execute(
        "INSERT INTO users (token, last_activity_at) VALUES (?1, ?2)",
        params![user.token, encode_ts(user.last_activity_at)],
    )?;
    Ok(())
}

pub(crate) fn get_user(conn: &Connection, token: &str) -> SessionResult<Option<User>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT token, last_activity_at FROM users WHERE token = ?1",
            params![token],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(token, last_activity_at)| {
        Ok(User {
            last_activity_at: decode_ts("last_activity_at", &last_activity_at)?,
            token,
        })
    })
    .transpose()
}

pub(crate) fn user_exists(conn: &Connection, token: &str) -> SessionResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn touch_user(conn: &Connection, token: &str, now: DateTime<Utc>) -> SessionResult<()> {
    conn.execute(
        "UPDATE users SET last_activity_at = ?2 WHERE token = ?1",
        params![token, encode_ts(now)],
    )?;
    Ok(())
}

pub(crate) fn delete_user(conn: &Connection, token: &str) -> SessionResult<bool> {
    let deleted = conn.execute("DELETE FROM users WHERE token = ?1", params![token])?;
    Ok(deleted > 0)
}

pub(crate) fn count_users(conn: &Connection) -> SessionResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
}

// ============================================================================
// Session rows
// ============================================================================

pub(crate) fn insert_session(conn: &Connection, session: &Session) -> SessionResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        params![
            session.session_id,
            session.user_token,
            session.api_key,
            session.code,
            session.code_valid_until.map(encode_ts),
            encode_ts(session.expires_at),
            session.session_duration,
            session.validated,
            encode_ts(session.created_at),
            session.parent_session_id,
        ],
    )?;
    Ok(())
}

pub(crate) fn get_session(conn: &Connection, session_id: &str) -> SessionResult<Option<Session>> {
    let row = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
            params![session_id],
            SessionRow::from_row,
        )
        .optional()?;
    row.map(Session::try_from).transpose()
}

pub(crate) fn session_exists(conn: &Connection, session_id: &str) -> SessionResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn update_expiry(
    conn: &Connection,
    session_id: &str,
    expires_at: DateTime<Utc>,
    session_duration: i64,
) -> SessionResult<bool> {
    let updated = conn.execute(
        "UPDATE sessions SET expires_at = ?2, session_duration = ?3 WHERE session_id = ?1",
        params![session_id, encode_ts(expires_at), session_duration],
    )?;
    Ok(updated > 0)
}

pub(crate) fn mark_validated(conn: &Connection, session_id: &str) -> SessionResult<bool> {
    let updated = conn.execute(
        "UPDATE sessions SET validated = 1 WHERE session_id = ?1",
        params![session_id],
    )?;
    Ok(updated > 0)
}

pub(crate) fn update_code(
    conn: &Connection,
    session_id: &str,
    code: &str,
    code_valid_until: DateTime<Utc>,
) -> SessionResult<bool> {
    let updated = conn.execute(
        "UPDATE sessions SET code = ?2, code_valid_until = ?3 \
         WHERE session_id = ?1 AND parent_session_id IS NULL",
        params![session_id, code, encode_ts(code_valid_until)],
    )?;
    Ok(updated > 0)
}

/// Move every child of `old_parent` under `new_parent`.
pub(crate) fn reparent_children(
    conn: &Connection,
    old_parent: &str,
    new_parent: &str,
) -> SessionResult<usize> {
    Ok(conn.execute(
        "UPDATE sessions SET parent_session_id = ?2 WHERE parent_session_id = ?1",
        params![old_parent, new_parent],
    )?)
}

/// Delete one session. Children go with it through the foreign key.
pub(crate) fn delete_session(conn: &Connection, session_id: &str) -> SessionResult<bool> {
    let deleted = conn.execute(
        "DELETE FROM sessions WHERE session_id = ?1",
        params![session_id],
    )?;
    Ok(deleted > 0)
}

pub(crate) fn delete_user_sessions(conn: &Connection, user_token: &str) -> SessionResult<()> {
    conn.execute(
        "DELETE FROM sessions WHERE user_token = ?1",
        params![user_token],
    )?;
    Ok(())
}

pub(crate) fn delete_expired(conn: &Connection, before: DateTime<Utc>) -> SessionResult<()> {
    // Past the storable range every row has expired
    if before.year() > MAX_STORED_YEAR {
        conn.execute("DELETE FROM sessions", [])?;
        return Ok(());
    }
    conn.execute(
        "DELETE FROM sessions WHERE expires_at <= ?1",
        params![encode_ts(before)],
    )?;
    Ok(())
}

pub(crate) fn count_sessions(conn: &Connection) -> SessionResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
}

pub(crate) fn list_user_sessions(
    conn: &Connection,
    user_token: &str,
) -> SessionResult<Vec<Session>> {
    collect_sessions(
        conn,
        &format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_token = ?1 ORDER BY created_at, session_id"
        ),
        params![user_token],
    )
}

pub(crate) fn list_children(
    conn: &Connection,
    parent_session_id: &str,
) -> SessionResult<Vec<Session>> {
    collect_sessions(
        conn,
        &format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE parent_session_id = ?1 ORDER BY created_at, session_id"
        ),
        params![parent_session_id],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(token: &str) -> User {
        User {
            token: token.to_string(),
            last_activity_at: normalize(Utc::now()),
        }
    }

    fn session(id: &str, user_token: &str, parent: Option<&str>) -> Session {
        let now = normalize(Utc::now());
        Session {
            session_id: id.to_string(),
            user_token: user_token.to_string(),
            api_key: "key".to_string(),
            code: parent.is_none().then(|| "000042".to_string()),
            code_valid_until: parent.is_none().then(|| now + Duration::seconds(300)),
            expires_at: now + Duration::seconds(1800),
            session_duration: 1800,
            validated: parent.is_some(),
            created_at: now,
            parent_session_id: parent.map(str::to_string),
        }
    }

    #[test]
    fn test_session_row_roundtrip() {
        let store = SessionStore::open_in_memory().unwrap();
        let conn = store.lock().unwrap();

        insert_user(&conn, &user("u1")).unwrap();
        let stored = session("s1", "u1", None);
        insert_session(&conn, &stored).unwrap();

        assert_eq!(get_session(&conn, "s1").unwrap(), Some(stored));
        assert!(get_session(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let store = SessionStore::open_in_memory().unwrap();
        let conn = store.lock().unwrap();

        let orphan = session("s1", "nobody", None);
        assert!(matches!(
            insert_session(&conn, &orphan),
            Err(SessionError::Storage(_))
        ));
    }

    #[test]
    fn test_delete_cascades_to_children() {
        let store = SessionStore::open_in_memory().unwrap();
        let conn = store.lock().unwrap();

        insert_user(&conn, &user("u1")).unwrap();
        insert_session(&conn, &session("parent", "u1", None)).unwrap();
        insert_session(&conn, &session("child", "u1", Some("parent"))).unwrap();
        assert_eq!(count_sessions(&conn).unwrap(), 2);

        assert!(delete_session(&conn, "parent").unwrap());
        assert_eq!(count_sessions(&conn).unwrap(), 0);
    }

    #[test]
    fn test_delete_user_cascades() {
        let store = SessionStore::open_in_memory().unwrap();
        let conn = store.lock().unwrap();

        insert_user(&conn, &user("u1")).unwrap();
        insert_session(&conn, &session("a", "u1", None)).unwrap();
        insert_session(&conn, &session("b", "u1", Some("a"))).unwrap();

        assert!(delete_user(&conn, "u1").unwrap());
        assert_eq!(count_sessions(&conn).unwrap(), 0);
        assert_eq!(count_users(&conn).unwrap(), 0);
    }

    #[test]
    fn test_timestamp_encoding_is_fixed_width() {
        let a = encode_ts(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let b = encode_ts(DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert!(a.ends_with('Z'));
    }

    #[test]
    fn test_checked_offset_bounds() {
        let now = normalize(Utc::now());
        assert_eq!(checked_offset(now, 60).unwrap(), now + Duration::seconds(60));
        assert!(matches!(
            checked_offset(now, i64::MAX),
            Err(SessionError::InvalidDuration(i64::MAX))
        ));

        let near_end = DateTime::from_timestamp(253_402_300_000, 0).unwrap();
        assert_eq!(near_end.year(), MAX_STORED_YEAR);
        assert!(checked_offset(near_end, 86_400).is_err());
    }

    #[test]
    fn test_delete_expired_beyond_storable_range() {
        let store = SessionStore::open_in_memory().unwrap();
        let conn = store.lock().unwrap();

        insert_user(&conn, &user("u1")).unwrap();
        insert_session(&conn, &session("a", "u1", None)).unwrap();
        insert_session(&conn, &session("b", "u1", Some("a"))).unwrap();

        let far = DateTime::from_timestamp(300_000_000_000, 0).unwrap();
        assert!(encode_ts(far) < encode_ts(Utc::now()));

        delete_expired(&conn, far).unwrap();
        assert_eq!(count_sessions(&conn).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_timestamp_is_reported() {
        let store = SessionStore::open_in_memory().unwrap();
        let conn = store.lock().unwrap();

        insert_user(&conn, &user("u1")).unwrap();
        insert_session(&conn, &session("s1", "u1", None)).unwrap();
        conn.execute(
            "UPDATE sessions SET expires_at = 'yesterday' WHERE session_id = 's1'",
            [],
        )
        .unwrap();

        assert!(matches!(
            get_session(&conn, "s1"),
            Err(SessionError::Corrupt(_))
        ));
    }
}
