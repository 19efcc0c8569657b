use anyhow::{Context, Result};
use blob_mover::{
    config::{AppConfig, Command, LockMode},
    errors::JobError,
    services::{
        clock::{Clock, SystemClock},
        engine::MigrationEngine,
        local_store::LocalStore,
        lock::LockStrategy,
        metadata_lease::{MetadataLease, sweep_expired},
        native_lease::NativeLease,
        store::{ObjectStore, StoreError},
    },
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{path::Path, process::ExitCode, str::FromStr, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("blob-mover aborted: {:#}", err);
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<u8> {
    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting blob-mover ({:?}) with config: {:?}", command, cfg);

    let store = open_local_store(&cfg).await?;

    // --- Handle migration mode ---
    if command == Command::Migrate {
        store.migrate().await?;
        for name in [&cfg.source.container, &cfg.destination.container] {
            if name.is_empty() {
                continue;
            }
            match store.create_container(name).await {
                Ok(_) => tracing::info!("Created container {}", name),
                Err(StoreError::ContainerAlreadyExists(_)) => {
                    tracing::debug!("Container {} already exists", name)
                }
                Err(err) => return Err(err.into()),
            }
        }
        tracing::info!("Schema migration complete.");
        return Ok(0);
    }

    store.ping().await.map_err(JobError::Backend)?;
    let store: Arc<dyn ObjectStore> = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match command {
        Command::Sweep => {
            let report = sweep_expired(&*store, &*clock, &cfg.source)
                .await
                .map_err(|error| JobError::List {
                    scope: cfg.source.clone(),
                    error,
                })?;
            emit(&cfg, &report)?;
            Ok(if report.failed > 0 { 2 } else { 0 })
        }
        Command::Plan => {
            let engine = build_engine(&cfg, store, clock)?;
            let plan = engine.plan(&cfg.source, &cfg.destination).await?;
            if cfg.json {
                emit(&cfg, &plan)?;
            } else {
                for entry in &plan {
                    println!(
                        "{}\t{}\t{}",
                        entry.key,
                        entry.destination.as_deref().unwrap_or("-"),
                        if entry.locked { "locked" } else { "free" }
                    );
                }
            }
            Ok(0)
        }
        Command::Run | Command::Migrate => {
            let engine = build_engine(&cfg, store, clock)?;
            let report = engine.run_pass(&cfg.source, &cfg.destination).await?;
            emit(&cfg, &report)?;
            Ok(u8::try_from(report.exit_code()).unwrap_or(1))
        }
    }
}

/// Open the SQLite pool, creating the database file and storage directory
/// on first use.
async fn open_local_store(cfg: &AppConfig) -> Result<LocalStore> {
    let storage_dir = Path::new(&cfg.storage_dir);
    if !storage_dir.exists() {
        std::fs::create_dir_all(storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    Ok(LocalStore::new(Arc::new(pool), cfg.storage_dir.clone()))
}

fn build_engine(
    cfg: &AppConfig,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
) -> Result<MigrationEngine> {
    let lock: Arc<dyn LockStrategy> = match cfg.lock {
        LockMode::Native => Arc::new(
            NativeLease::new(store.clone(), clock, cfg.native_lease_ttl)
                .context("native lock strategy selected")?,
        ),
        LockMode::Metadata => Arc::new(
            MetadataLease::new(store.clone(), clock, cfg.lease_duration)
                .conditional(cfg.conditional_metadata),
        ),
    };
    tracing::info!("Using {:?}", lock);
    Ok(MigrationEngine::new(store, lock).with_concurrency(cfg.concurrency))
}

/// Print `value` as JSON on stdout when `--json` was given.
fn emit<T: Serialize>(cfg: &AppConfig, value: &T) -> Result<()> {
    if cfg.json {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}
