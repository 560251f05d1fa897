use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    chunk_store::ChunkStore,
    gc::start_sweep_task,
    persistence::{JsonSnapshotBackend, SnapshotBackend, SqliteSnapshotBackend, run_migrations},
    share_service::{ShareService, UploadLimits},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting pickup-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Handle migration mode ---
    if migrate {
        let Some(db_url) = cfg.database_url.as_deref() else {
            anyhow::bail!("--migrate needs a database URL (--database-url or PICKUP_DATABASE_URL)");
        };
        let pool = connect_sqlite(db_url).await?;
        run_migrations(&pool).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Pick snapshot backend ---
    let backend: Arc<dyn SnapshotBackend> = match cfg.database_url.as_deref() {
        Some(db_url) => {
            let pool = connect_sqlite(db_url).await?;
            Arc::new(SqliteSnapshotBackend::new(Arc::new(pool)).await?)
        }
        None => Arc::new(JsonSnapshotBackend::new(&cfg.state_dir)),
    };
    tracing::info!("Snapshots stored as {}", backend.describe());

    // --- Initialize core service ---
    let service = ShareService::new(
        ChunkStore::new(&cfg.storage_dir),
        backend,
        UploadLimits {
            chunk_size: cfg.chunk_size,
            max_file_size: cfg.max_file_size,
        },
    );
    service
        .restore()
        .await
        .context("restoring state from snapshot")?;

    // --- Background sweeper ---
    start_sweep_task(service.gc.clone(), cfg.sweep_interval, cfg.sweep_retry);

    // --- Build router ---
    let chunk_limit = usize::try_from(cfg.chunk_size).context("chunk size does not fit in memory")?;
    let app: Router = routes::routes::routes(chunk_limit).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Open a SQLite pool, creating the database file (and its directory) if
/// needed.
async fn connect_sqlite(db_url: &str) -> Result<sqlx::SqlitePool> {
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?
        .create_if_missing(true);

    let db_path = options.get_filename();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;
    Ok(pool)
}
