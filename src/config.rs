use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub state_dir: String,
    pub database_url: Option<String>,
    pub chunk_size: u64,
    pub max_file_size: u64,
    pub sweep_interval: Duration,
    pub sweep_retry: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked upload service with pickup codes")]
pub struct Args {
    /// Host to bind to (overrides PICKUP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PICKUP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for chunk areas and merged files (overrides PICKUP_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory for JSON snapshots (overrides PICKUP_STATE_DIR)
    #[arg(long)]
    pub state_dir: Option<String>,

    /// SQLite URL; when set, snapshots go to SQLite instead of JSON files
    /// (overrides PICKUP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Chunk size in bytes (overrides PICKUP_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Largest accepted declared file size in bytes (overrides PICKUP_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Seconds between background sweeps (overrides PICKUP_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Seconds to wait before retrying a failed sweep (overrides PICKUP_SWEEP_RETRY_SECS)
    #[arg(long)]
    pub sweep_retry_secs: Option<u64>,

    /// Apply the SQLite schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::resolve(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge CLI args over values looked up through `env`, over defaults.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<(Self, bool)> {
        let parsed = |key: &str, default: u64| -> Result<u64> { env_parse(&env, key, default) };

        let env_port = env_parse(&env, "PICKUP_PORT", 8000u16)?;
        let cfg = Self {
            host: args
                .host
                .or_else(|| env("PICKUP_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.unwrap_or(env_port),
            storage_dir: args
                .storage_dir
                .or_else(|| env("PICKUP_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/uploads".into()),
            state_dir: args
                .state_dir
                .or_else(|| env("PICKUP_STATE_DIR"))
                .unwrap_or_else(|| "./data/state".into()),
            database_url: args
                .database_url
                .or_else(|| env("PICKUP_DATABASE_URL"))
                .filter(|url| !url.is_empty()),
            chunk_size: match args.chunk_size {
                Some(v) => v,
                None => parsed("PICKUP_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            },
            max_file_size: match args.max_file_size {
                Some(v) => v,
                None => parsed("PICKUP_MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE)?,
            },
            sweep_interval: Duration::from_secs(match args.sweep_interval_secs {
                Some(v) => v,
                None => parsed("PICKUP_SWEEP_INTERVAL_SECS", 3600)?,
            }),
            sweep_retry: Duration::from_secs(match args.sweep_retry_secs {
                Some(v) => v,
                None => parsed("PICKUP_SWEEP_RETRY_SECS", 60)?,
            }),
        };

        if cfg.chunk_size == 0 {
            anyhow::bail!("chunk size must be greater than zero");
        }
        if cfg.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be greater than zero");
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env(key) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
