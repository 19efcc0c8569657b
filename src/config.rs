use crate::models::scope::Scope;
use anyhow::{Context, Result, bail};
use chrono::Duration;
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, str::FromStr};

/// Default metadata lease length, in minutes.
pub const DEFAULT_LEASE_MINUTES: i64 = 10;
/// Default native lease TTL, in seconds.
pub const DEFAULT_NATIVE_LEASE_SECONDS: i64 = 60;
/// Longest lease either strategy may be configured with.
pub const MAX_LEASE_DAYS: i64 = 7;

/// How objects are locked while being moved.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Backend lease API; atomic.
    Native,
    /// Advisory `lease_expiration` metadata field.
    Metadata,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    /// Run one migration pass (default)
    #[default]
    Run,
    /// List what a pass would move, and each object's lock state, without changing anything
    Plan,
    /// Clear expired `lease_expiration` fields under the source scope
    Sweep,
    /// Apply the local backend schema, create the configured containers and exit
    Migrate,
}

/// Centralized job configuration, resolved once at startup.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub storage_dir: String,
    pub source: Scope,
    pub destination: Scope,
    pub lock: LockMode,
    pub lease_duration: Duration,
    pub native_lease_ttl: Duration,
    pub conditional_metadata: bool,
    pub concurrency: usize,
    pub json: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(
    author,
    version,
    about = "Move objects between blob store scopes, one worker per object at a time"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Metadata database URL (overrides BLOB_MOVER_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Directory where object payloads are stored (overrides BLOB_MOVER_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Container to move objects out of (overrides SOURCE_CONTAINER)
    #[arg(long, global = true)]
    pub source_container: Option<String>,

    /// Container to move objects into (overrides DESTINATION_CONTAINER; defaults to the source container)
    #[arg(long, global = true)]
    pub destination_container: Option<String>,

    /// Folder inside the source container (overrides SOURCE_FOLDER)
    #[arg(long, global = true)]
    pub source_folder: Option<String>,

    /// Folder inside the destination container (overrides DESTINATION_FOLDER)
    #[arg(long, global = true)]
    pub destination_folder: Option<String>,

    /// Lock strategy (overrides LOCK_STRATEGY)
    #[arg(long, value_enum, global = true)]
    pub lock: Option<LockMode>,

    /// Metadata lease length in minutes (overrides LEASE_DURATION_MINUTES)
    #[arg(long, global = true)]
    pub lease_duration_minutes: Option<i64>,

    /// Native lease TTL in seconds (overrides NATIVE_LEASE_SECONDS)
    #[arg(long, global = true)]
    pub native_lease_seconds: Option<i64>,

    /// Guard metadata lease writes with a generation precondition (overrides CONDITIONAL_METADATA)
    #[arg(long, global = true)]
    pub conditional_metadata: bool,

    /// Objects processed at once in this process (overrides MIGRATION_CONCURRENCY)
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Print the report as JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,
}

impl AppConfig {
    /// Parse CLI args and the process environment into an AppConfig and the
    /// command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        Self::resolve(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge `args` over the variables returned by `lookup`.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<(Self, Command)> {
        let command = args.command.unwrap_or_default();

        let database_url = args
            .database_url
            .or_else(|| lookup("BLOB_MOVER_DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/blob_mover.db".into());
        let storage_dir = args
            .storage_dir
            .or_else(|| lookup("BLOB_MOVER_STORAGE_DIR"))
            .unwrap_or_else(|| "./data/objects".into());

        let source_container = args
            .source_container
            .or_else(|| lookup("SOURCE_CONTAINER"))
            .unwrap_or_default();
        if source_container.is_empty() && command != Command::Migrate {
            bail!("a source container is required (--source-container or SOURCE_CONTAINER)");
        }
        let destination_container = args
            .destination_container
            .or_else(|| lookup("DESTINATION_CONTAINER"))
            .unwrap_or_else(|| source_container.clone());
        let source_folder = args
            .source_folder
            .or_else(|| lookup("SOURCE_FOLDER"))
            .unwrap_or_default();
        let destination_folder = args
            .destination_folder
            .or_else(|| lookup("DESTINATION_FOLDER"))
            .unwrap_or_default();

        let lock = match args.lock {
            Some(lock) => lock,
            None => match lookup("LOCK_STRATEGY") {
                Some(value) => LockMode::from_str(&value, true)
                    .map_err(|err| anyhow::anyhow!("parsing LOCK_STRATEGY value `{}`: {}", value, err))?,
                None => LockMode::Native,
            },
        };

        let lease_minutes = match args.lease_duration_minutes {
            Some(minutes) => minutes,
            None => parse_var(&lookup, "LEASE_DURATION_MINUTES")?.unwrap_or(DEFAULT_LEASE_MINUTES),
        };
        let lease_duration = lease_length(Duration::try_minutes(lease_minutes))
            .with_context(|| format!("lease duration of {} minutes", lease_minutes))?;

        let native_seconds = match args.native_lease_seconds {
            Some(seconds) => seconds,
            None => parse_var(&lookup, "NATIVE_LEASE_SECONDS")?
                .unwrap_or(DEFAULT_NATIVE_LEASE_SECONDS),
        };
        let native_lease_ttl = lease_length(Duration::try_seconds(native_seconds))
            .with_context(|| format!("native lease TTL of {} seconds", native_seconds))?;

        let concurrency = match args.concurrency {
            Some(concurrency) => concurrency,
            None => parse_var(&lookup, "MIGRATION_CONCURRENCY")?.unwrap_or(1),
        };
        if concurrency == 0 {
            bail!("concurrency must be at least 1");
        }

        let conditional_metadata = args.conditional_metadata
            || lookup("CONDITIONAL_METADATA")
                .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));

        let cfg = Self {
            database_url,
            storage_dir,
            source: Scope::from_folder(source_container, &source_folder),
            destination: Scope::from_folder(destination_container, &destination_folder),
            lock,
            lease_duration,
            native_lease_ttl,
            conditional_metadata,
            concurrency,
            json: args.json,
        };

        Ok((cfg, command))
    }
}

/// Accept a lease length in `(0, MAX_LEASE_DAYS]`.
fn lease_length(duration: Option<Duration>) -> Result<Duration> {
    let max = Duration::days(MAX_LEASE_DAYS);
    match duration {
        None => bail!("out of range"),
        Some(duration) if duration <= Duration::zero() => bail!("must be positive"),
        Some(duration) if duration > max => bail!("must not exceed {} days", MAX_LEASE_DAYS),
        Some(duration) => Ok(duration),
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(None),
    }
}
