//! Prometheus metrics for the storage engine.
//!
//! The engine records through the `metrics` facade macros (`counter!`, `gauge!`)
//! wherever the work happens: the store counts appends and commit decisions and
//! tracks the Writer position, the scavenger counts rewritten chunks and reclaimed
//! bytes. This module installs the global Prometheus recorder and serves the
//! rendered snapshot over HTTP at `GET /metrics`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics::{Unit, describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;

/// Error type for metrics installation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The global metrics recorder has already been installed.
    #[error("metrics recorder already installed")]
    AlreadyInstalled,

    /// The Prometheus recorder could not be built or registered.
    #[error("failed to install metrics recorder: {0}")]
    Install(String),
}

/// Cheaply cloneable handle to the installed Prometheus recorder.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    inner: Arc<PrometheusHandle>,
}

impl MetricsHandle {
    /// Render the current metrics snapshot in Prometheus exposition format.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

static RECORDER_HANDLE: std::sync::OnceLock<MetricsHandle> = std::sync::OnceLock::new();

/// Install the global Prometheus metrics recorder and describe the engine's
/// metrics.
///
/// Must be called before the store is opened for the open-time gauges to be
/// recorded.
///
/// # Returns
///
/// A [`MetricsHandle`] that can render the current metrics snapshot.
///
/// # Errors
///
/// Returns [`MetricsError::AlreadyInstalled`] on a second call in the same process
/// and [`MetricsError::Install`] if the recorder cannot be registered.
pub fn install_recorder() -> Result<MetricsHandle, MetricsError> {
    if RECORDER_HANDLE.get().is_some() {
        return Err(MetricsError::AlreadyInstalled);
    }
    let prom_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        if RECORDER_HANDLE.get().is_some() {
            MetricsError::AlreadyInstalled
        } else {
            MetricsError::Install(e.to_string())
        }
    })?;
    let handle = MetricsHandle {
        inner: Arc::new(prom_handle),
    };
    RECORDER_HANDLE
        .set(handle.clone())
        .map_err(|_| MetricsError::AlreadyInstalled)?;
    describe_metrics();
    Ok(handle)
}

/// Returns the previously installed [`MetricsHandle`], if any.
///
/// Tests use this when another test in the same process already installed the
/// recorder.
pub fn get_installed_handle() -> Option<MetricsHandle> {
    RECORDER_HANDLE.get().cloned()
}

fn describe_metrics() {
    describe_counter!(
        "eventfold_appends_total",
        Unit::Count,
        "Transactions committed with at least one event"
    );
    describe_counter!(
        "eventfold_events_appended_total",
        Unit::Count,
        "Events made visible by commits"
    );
    describe_counter!(
        "eventfold_commit_decisions_total",
        Unit::Count,
        "Commit validator decisions, labelled by decision"
    );
    describe_gauge!(
        "eventfold_writer_position",
        Unit::Bytes,
        "Durable, indexed Writer position of the log"
    );
    describe_counter!(
        "eventfold_chunks_scavenged_total",
        Unit::Count,
        "Chunks replaced by scavenged rewrites"
    );
    describe_counter!(
        "eventfold_scavenge_bytes_reclaimed_total",
        Unit::Bytes,
        "Record bytes removed by the scavenger"
    );
}

/// The axum [`Router`] serving Prometheus metrics at `GET /metrics`.
fn metrics_router(handle: MetricsHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move {
                (
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    h.render(),
                )
            }
        }),
    )
}

/// Spawn an axum HTTP server that serves Prometheus metrics at `GET /metrics`.
///
/// On bind failure, logs `tracing::error!` and returns a `JoinHandle` that
/// resolves immediately.
///
/// # Arguments
///
/// * `handle` - The metrics handle from [`install_recorder()`].
/// * `addr` - The socket address to bind on (use port 0 for ephemeral).
pub fn serve_metrics(handle: MetricsHandle, addr: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "failed to bind metrics listener");
                return;
            }
        };
        run_server(handle, listener).await;
    })
}

/// Spawn the metrics server on an already-bound listener.
///
/// Lets a caller learn the ephemeral port before the server starts.
pub fn serve_metrics_on_listener(
    handle: MetricsHandle,
    listener: tokio::net::TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(run_server(handle, listener))
}

async fn run_server(handle: MetricsHandle, listener: tokio::net::TcpListener) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!(addr = %addr, "metrics server listening"),
        Err(e) => tracing::warn!(error = %e, "metrics listener has no local address"),
    }
    if let Err(e) = axum::serve(listener, metrics_router(handle)).await {
        tracing::error!(error = %e, "metrics server error");
    }
}
