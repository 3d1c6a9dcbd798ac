use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use eventfold_storage::config::{DEFAULT_CHUNK_SIZE, DEFAULT_DEDUP_CAPACITY};
use eventfold_storage::metrics::{install_recorder, serve_metrics};
use eventfold_storage::scavenger::spawn_scavenger;
use eventfold_storage::{Broker, ScavengeOptions, Scavenger, StorageConfig, Store, spawn_writer};
use tokio_util::sync::CancellationToken;

/// Engine configuration parsed from environment variables.
///
/// # Environment Variables
///
/// | Variable                           | Required | Default     | Description                              |
/// |------------------------------------|----------|-------------|------------------------------------------|
/// | `EVENTFOLD_DATA`                   | Yes      | --          | Directory holding chunks and checkpoints |
/// | `EVENTFOLD_CHUNK_SIZE`             | No       | `268435456` | Logical chunk size in bytes              |
/// | `EVENTFOLD_BROKER_CAPACITY`        | No       | `4096`      | Broadcast channel buffer size            |
/// | `EVENTFOLD_DEDUP_CAPACITY`         | No       | `128`       | Event ids remembered for idempotency     |
/// | `EVENTFOLD_VERIFY_HASHES`          | No       | `false`     | Verify completed chunk hashes on open    |
/// | `EVENTFOLD_MERGE_CHUNKS`           | No       | `false`     | Merge small chunks while scavenging      |
/// | `EVENTFOLD_METRICS_LISTEN`         | No       | --          | Prometheus endpoint address              |
/// | `EVENTFOLD_SCAVENGE_INTERVAL_SECS` | No       | --          | Seconds between scavenge passes          |
#[derive(Debug, Clone, PartialEq)]
struct Config {
    /// Options handed to [`Store::open`].
    storage: StorageConfig,
    /// Broadcast channel ring buffer capacity for live subscriptions.
    broker_capacity: usize,
    /// Address of the `/metrics` endpoint. `None` disables the exporter.
    metrics_listen: Option<SocketAddr>,
    /// Pause between scavenge passes. `None` disables background scavenging.
    scavenge_interval: Option<Duration>,
}

/// Default broadcast channel capacity when `EVENTFOLD_BROKER_CAPACITY` is not set.
const DEFAULT_BROKER_CAPACITY: usize = 4096;

/// Capacity of the writer's request channel.
const WRITER_CHANNEL_CAPACITY: usize = 64;

fn parse_var<T>(name: &str) -> Result<Option<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(val) => val
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("{name} is not valid: {e}")),
        Err(_) => Ok(None),
    }
}

fn parse_flag(name: &str) -> Result<bool, String> {
    match std::env::var(name) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(format!("{name} must be true or false, got: {other}")),
        },
        Err(_) => Ok(false),
    }
}

impl Config {
    /// Parse engine configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if:
    /// - `EVENTFOLD_DATA` is not set
    /// - a numeric variable is set but does not parse
    /// - `EVENTFOLD_DEDUP_CAPACITY` or `EVENTFOLD_BROKER_CAPACITY` is zero
    /// - `EVENTFOLD_METRICS_LISTEN` is set but not a valid `SocketAddr`
    /// - a flag variable is set to something other than a boolean
    fn from_env() -> Result<Config, String> {
        let data_dir = std::env::var("EVENTFOLD_DATA")
            .map(PathBuf::from)
            .map_err(|_| "EVENTFOLD_DATA environment variable is required".to_string())?;

        let chunk_size = parse_var::<u64>("EVENTFOLD_CHUNK_SIZE")?.unwrap_or(DEFAULT_CHUNK_SIZE);

        let broker_capacity =
            parse_var::<usize>("EVENTFOLD_BROKER_CAPACITY")?.unwrap_or(DEFAULT_BROKER_CAPACITY);
        if broker_capacity == 0 {
            return Err("EVENTFOLD_BROKER_CAPACITY must be nonzero".to_string());
        }

        let dedup_capacity =
            parse_var::<usize>("EVENTFOLD_DEDUP_CAPACITY")?.unwrap_or(DEFAULT_DEDUP_CAPACITY);
        if dedup_capacity == 0 {
            return Err("EVENTFOLD_DEDUP_CAPACITY must be nonzero".to_string());
        }

        let metrics_listen = parse_var::<SocketAddr>("EVENTFOLD_METRICS_LISTEN")?;

        let scavenge_interval = parse_var::<u64>("EVENTFOLD_SCAVENGE_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let storage = StorageConfig::new(data_dir)
            .with_chunk_size(chunk_size)
            .with_dedup_capacity(dedup_capacity)
            .with_verify_hashes(parse_flag("EVENTFOLD_VERIFY_HASHES")?)
            .with_merge_chunks(parse_flag("EVENTFOLD_MERGE_CHUNKS")?);

        Ok(Config {
            storage,
            broker_capacity,
            metrics_listen,
            scavenge_interval,
        })
    }
}

/// Initialize the global `tracing` subscriber with an `EnvFilter`.
///
/// Reads `RUST_LOG`, defaulting to `"info"`. Uses `try_init()` so that repeated
/// calls in one test process are a silent no-op.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Waits for a shutdown signal: SIGINT on all platforms, plus SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    tracing::info!(data_dir = %config.storage.data_dir.display(), "Data directory");
    tracing::info!(chunk_size = config.storage.chunk_size, "Chunk size");
    tracing::info!(broker_capacity = config.broker_capacity, "Broker capacity");

    // The recorder goes in before the store opens so open-time gauges land.
    let metrics_task = match config.metrics_listen {
        Some(addr) => match install_recorder() {
            Ok(handle) => Some(serve_metrics(handle, addr)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install metrics recorder");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let store = match Store::open(&config.storage) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open store");
            std::process::exit(1);
        }
    };

    let broker = Broker::new(config.broker_capacity);
    let (writer_handle, read_index, join_handle) =
        spawn_writer(store, WRITER_CHANNEL_CAPACITY, broker);
    tracing::info!(
        streams = read_index.list_streams().len(),
        writer_position = read_index.writer_position(),
        "Recovered log"
    );

    let scavenge_token = CancellationToken::new();
    let scavenge_task = config.scavenge_interval.map(|interval| {
        tracing::info!(interval_secs = interval.as_secs(), "Background scavenging enabled");
        let scavenger = Scavenger::new(
            read_index.chunk_db().clone(),
            read_index.clone(),
            ScavengeOptions {
                merge_chunks: config.storage.merge_chunks,
            },
        );
        spawn_scavenger(scavenger, interval, scavenge_token.clone())
    });

    shutdown_signal().await;

    // Stop the scavenger first so no chunk swap races the final flush.
    tracing::info!("Shutting down");
    scavenge_token.cancel();
    if let Some(task) = scavenge_task
        && let Err(e) = task.await
    {
        tracing::error!(error = %e, "scavenger task failed");
    }
    drop(writer_handle);
    if let Err(e) = join_handle.await {
        tracing::error!(error = %e, "writer task failed");
    }
    if let Some(task) = metrics_task {
        task.abort();
    }
}
