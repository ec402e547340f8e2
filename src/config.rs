//! Startup configuration.
//!
//! Configuration is read once, validated once, and then passed by value to
//! the components that need it. Nothing here is global.

use std::env;
use std::path::PathBuf;

use crate::cipher::{self, CipherError, TokenCipher};
use crate::error::{SessionError, SessionResult};
use crate::types::{DEFAULT_CODE_VALIDITY_SECONDS, DEFAULT_SESSION_DURATION_SECONDS};

/// Maximum session duration: 30 days.
pub const MAX_SESSION_DURATION_SECONDS: i64 = 2_592_000;

/// Maximum code validity window: 1 day.
pub const MAX_CODE_VALIDITY_SECONDS: i64 = 86_400;

/// Hard ceiling for any configured bound: 10 years.
pub const DURATION_CEILING_SECONDS: i64 = 315_360_000;

/// Default interval between expiry sweeps: 1 minute.
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Default cipher context for identity tokens.
pub const DEFAULT_TOKEN_CONTEXT: &str = "session";

/// Configuration for the session engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the SQLite database (default: None = in-memory)
    pub database_path: Option<PathBuf>,

    /// Session lifetime when the caller does not choose one (default: 1800)
    pub default_session_duration_seconds: i64,

    /// Code validity window when the caller does not choose one (default: 300)
    pub default_code_validity_seconds: i64,

    /// Upper bound for any requested session lifetime (default: 30 days)
    pub max_session_duration_seconds: i64,

    /// Upper bound for any requested code validity window (default: 1 day)
    pub max_code_validity_seconds: i64,

    /// Interval between expiry sweeps (default: 60)
    pub sweep_interval_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            default_session_duration_seconds: DEFAULT_SESSION_DURATION_SECONDS,
            default_code_validity_seconds: DEFAULT_CODE_VALIDITY_SECONDS,
            max_session_duration_seconds: MAX_SESSION_DURATION_SECONDS,
            max_code_validity_seconds: MAX_CODE_VALIDITY_SECONDS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
        }
    }
}

impl EngineConfig {
    /// In-memory configuration with defaults.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed configuration with defaults.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Read configuration from `PASSGATE_*` environment variables.
    ///
    /// Unset variables keep their defaults. The result is validated.
    pub fn from_env() -> SessionResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = env::var("PASSGATE_DB_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }
        if let Some(value) = env_number::<i64>("PASSGATE_SESSION_DURATION")? {
            config.default_session_duration_seconds = value;
        }
        if let Some(value) = env_number::<i64>("PASSGATE_CODE_VALIDITY")? {
            config.default_code_validity_seconds = value;
        }
        if let Some(value) = env_number::<i64>("PASSGATE_MAX_SESSION_DURATION")? {
            config.max_session_duration_seconds = value;
        }
        if let Some(value) = env_number::<i64>("PASSGATE_MAX_CODE_VALIDITY")? {
            config.max_code_validity_seconds = value;
        }
        if let Some(value) = env_number::<u64>("PASSGATE_SWEEP_INTERVAL")? {
            config.sweep_interval_seconds = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject non-positive durations and inconsistent bounds.
    pub fn validate(&self) -> SessionResult<()> {
        if self.default_session_duration_seconds <= 0 {
            return Err(SessionError::Config(format!(
                "session duration must be positive, got {}",
                self.default_session_duration_seconds
            )));
        }
        if self.default_code_validity_seconds <= 0 {
            return Err(SessionError::Config(format!(
                "code validity must be positive, got {}",
                self.default_code_validity_seconds
            )));
        }
        if self.max_session_duration_seconds < self.default_session_duration_seconds {
            return Err(SessionError::Config(format!(
                "max session duration {} is below the default {}",
                self.max_session_duration_seconds, self.default_session_duration_seconds
            )));
        }
        if self.max_code_validity_seconds < self.default_code_validity_seconds {
            return Err(SessionError::Config(format!(
                "max code validity {} is below the default {}",
                self.max_code_validity_seconds, self.default_code_validity_seconds
            )));
        }
        for (name, value) in [
            ("max session duration", self.max_session_duration_seconds),
            ("max code validity", self.max_code_validity_seconds),
        ] {
            if value > DURATION_CEILING_SECONDS {
                return Err(SessionError::Config(format!(
                    "{name} {value} exceeds the ceiling {DURATION_CEILING_SECONDS}"
                )));
            }
        }
        if self.sweep_interval_seconds == 0 {
            return Err(SessionError::Config(
                "sweep interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Key material and context for the identity token cipher.
#[derive(Clone)]
pub struct CipherConfig {
    /// 32-byte encryption key
    pub key: [u8; cipher::KEY_SIZE],

    /// Associated-data context (default: "session")
    pub context: String,

    /// Secondary key enabling deterministic tokens
    pub unique_key: Option<Vec<u8>>,
}

impl CipherConfig {
    /// Build from a `base64:` encoded key.
    pub fn from_encoded_key(encoded: &str) -> Result<Self, CipherError> {
        Ok(Self {
            key: cipher::parse_key(encoded)?,
            context: DEFAULT_TOKEN_CONTEXT.to_string(),
            unique_key: None,
        })
    }

    /// Read `PASSGATE_KEY`, `PASSGATE_CONTEXT` and `PASSGATE_UNIQUE_KEY`.
    pub fn from_env() -> SessionResult<Self> {
        let encoded = env::var("PASSGATE_KEY")
            .map_err(|_| SessionError::Config("PASSGATE_KEY is not set".to_string()))?;
        let mut config = Self::from_encoded_key(&encoded)
            .map_err(|e| SessionError::Config(format!("PASSGATE_KEY: {e}")))?;

        if let Ok(context) = env::var("PASSGATE_CONTEXT") {
            config.context = context;
        }
        config.unique_key = env::var("PASSGATE_UNIQUE_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(String::into_bytes);

        Ok(config)
    }

    /// Construct the cipher described by this configuration.
    pub fn build(&self) -> Result<TokenCipher, CipherError> {
        let cipher = TokenCipher::new(&self.key, self.context.clone())?;
        Ok(match &self.unique_key {
            Some(unique_key) => cipher.with_unique_key(unique_key.clone()),
            None => cipher,
        })
    }
}

impl std::fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherConfig")
            .field("context", &self.context)
            .field("unique_key", &self.unique_key.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> SessionResult<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SessionError::Config(format!("{name} is not a number: {raw}"))),
        Err(_) => Ok(None),
    }
}
