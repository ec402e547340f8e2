/// passgate CLI - operator tool for the session store
///
/// Usage:
///   pgate keygen                         - Print a fresh base64: key
///   pgate encrypt <identity>             - Mint an opaque identity token
///   pgate decrypt <token>                - Recover the identity from a token
///   pgate sweep [--watch]                - Delete expired sessions
///   pgate stats                          - Show user and session counts
///   pgate sessions <user_token>          - List a user's live sessions
///   pgate revoke <session_id>            - Delete a session and its children
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use passgate::{
    CipherConfig, EngineConfig, Session, SessionEngine, TokenCipher, format_key, generate_key,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// passgate - passwordless code-based sessions
///
/// Inspect and maintain a passgate session store.
#[derive(Parser)]
#[command(name = "pgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Database file path (default: ~/.passgate/sessions.db)
    #[arg(short, long, global = true, env = "PASSGATE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Token key in base64:<44 chars> form
    #[arg(short, long, global = true, env = "PASSGATE_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Token context bound as associated data
    #[arg(long, global = true, env = "PASSGATE_CONTEXT", default_value = "session")]
    context: String,

    /// Unique key enabling deterministic tokens
    #[arg(long, global = true, env = "PASSGATE_UNIQUE_KEY", hide_env_values = true)]
    unique_key: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new token key
    ///
    /// Example:
    ///   pgate keygen >> .env
    Keygen,

    /// Encrypt an identity into an opaque token
    ///
    /// Examples:
    ///   pgate encrypt alice@example.com
    ///   pgate encrypt alice@example.com --deterministic --unique-key dedupe
    Encrypt {
        /// Identity to encrypt
        identity: String,

        /// Derive the nonce from the identity (requires --unique-key)
        #[arg(long)]
        deterministic: bool,
    },

    /// Decrypt an opaque token
    Decrypt {
        /// Token to decrypt
        token: String,
    },

    /// Delete expired sessions
    ///
    /// Examples:
    ///   pgate sweep                 # One pass
    ///   pgate sweep --watch         # Sweep every interval until Ctrl-C
    ///   pgate sweep --before "2026-01-01T00:00:00Z"
    Sweep {
        /// Keep sweeping on an interval
        #[arg(short, long)]
        watch: bool,

        /// Seconds between sweeps in watch mode
        #[arg(short, long)]
        interval: Option<u64>,

        /// Delete sessions expiring at or before this instant (ISO 8601)
        #[arg(long)]
        before: Option<String>,
    },

    /// Show store statistics
    Stats,

    /// List the live sessions of a user
    Sessions {
        /// Opaque user token
        user_token: String,
    },

    /// Delete a session and every session delegated from it
    Revoke {
        /// Session id
        session_id: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "passgate=debug,pgate=debug" } else { "passgate=info,pgate=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".passgate").join("sessions.db"))
}

fn open_engine(cli_path: Option<PathBuf>) -> Result<SessionEngine> {
    let mut config = EngineConfig::from_env().context("Invalid engine configuration")?;
    config.database_path = Some(match cli_path {
        Some(path) => path,
        None => default_db_path()?,
    });
    SessionEngine::open(config).context("Failed to open session store")
}

fn build_cipher(key: Option<&str>, context: &str, unique_key: Option<&str>) -> Result<TokenCipher> {
    let key = key.ok_or_else(|| anyhow!("No key given: pass --key or set PASSGATE_KEY"))?;
    let mut config = CipherConfig::from_encoded_key(key).context("Invalid key")?;
    config.context = context.to_string();
    config.unique_key = unique_key
        .filter(|k| !k.is_empty())
        .map(|k| k.as_bytes().to_vec());
    config.build().context("Failed to build cipher")
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn print_session(session: &Session) {
    println!(
        "  {} {}",
        session.session_id.cyan(),
        format!("[{}]", session.state()).bright_black()
    );
    let api_key = if session.api_key.is_empty() {
        "(empty)".bright_black().to_string()
    } else {
        session.api_key.clone()
    };
    println!("    API key: {}", api_key);
    println!("    Created: {}", format_timestamp(&session.created_at));
    println!("    Expires: {}", format_timestamp(&session.expires_at));
    if let Some(parent) = &session.parent_session_id {
        println!("    Parent:  {}", parent.bright_black());
    }
}

async fn run_sweeper(engine: SessionEngine, interval_seconds: u64) -> Result<()> {
    println!(
        "{} every {}s (Ctrl-C to stop)",
        "Sweeping".green().bold(),
        interval_seconds
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.delete_expired_sessions(None) {
                    Ok(removed) => tracing::debug!(removed, "Sweep pass complete"),
                    Err(e) => tracing::error!("Sweep failed: {}", e),
                }
            }
            _ = signal::ctrl_c() => {
                println!();
                println!("{}", "Stopped".yellow());
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Keygen => {
            println!("{}", format_key(&generate_key()));
            Ok(())
        }

        Commands::Encrypt { identity, deterministic } => {
            let cipher = build_cipher(cli.key.as_deref(), &cli.context, cli.unique_key.as_deref())?;
            if deterministic && !cipher.supports_deterministic() {
                eprintln!(
                    "{}",
                    "No unique key given, falling back to a random nonce".yellow()
                );
            }
            let token = cipher
                .encrypt_str(&identity, deterministic)
                .context("Failed to encrypt identity")?;
            println!("{}", token);
            Ok(())
        }

        Commands::Decrypt { token } => {
            let cipher = build_cipher(cli.key.as_deref(), &cli.context, cli.unique_key.as_deref())?;
            match cipher.decrypt(&token) {
                Some(identity) => {
                    println!("{}", String::from_utf8_lossy(&identity));
                    Ok(())
                }
                None => {
                    eprintln!("{}", "Error".red().bold());
                    eprintln!("  Token could not be decrypted");
                    std::process::exit(1);
                }
            }
        }

        Commands::Sweep { watch, interval, before } => {
            let engine = open_engine(cli.db_path)?;

            if watch {
                let interval = interval.unwrap_or(engine.config().sweep_interval_seconds);
                if interval == 0 {
                    return Err(anyhow!("Interval must be positive"));
                }
                return run_sweeper(engine, interval).await;
            }

            let before = before
                .map(|raw| {
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|ts| ts.with_timezone(&Utc))
                        .with_context(|| format!("Invalid timestamp format: {}", raw))
                })
                .transpose()?;

            let removed = engine.delete_expired_sessions(before)?;
            println!("{}", "OK".green().bold());
            println!("  Removed: {}", removed);
            Ok(())
        }

        Commands::Stats => {
            let engine = open_engine(cli.db_path)?;
            let stats = engine.stats()?;

            println!("{}", "Session Store".bold().cyan());
            println!();
            println!("  {} {}", "Users:".bright_white(), stats.users);
            println!("  {} {}", "Sessions:".bright_white(), stats.sessions);
            Ok(())
        }

        Commands::Sessions { user_token } => {
            let engine = open_engine(cli.db_path)?;
            let sessions = engine.list_user_sessions(&user_token)?;

            if sessions.is_empty() {
                println!("{}", "No live sessions".yellow());
            } else {
                println!("{}", format!("{} live session(s):", sessions.len()).bold());
                println!();
                for session in &sessions {
                    print_session(session);
                }
            }
            Ok(())
        }

        Commands::Revoke { session_id } => {
            let engine = open_engine(cli.db_path)?;
            if engine.delete_session(&session_id)? {
                println!("{}", "OK".green().bold());
                println!("  Revoked: {}", session_id.cyan());
                Ok(())
            } else {
                eprintln!("{}", "Error".red().bold());
                eprintln!("  Session not found: {}", session_id);
                std::process::exit(1);
            }
        }
    }
}
