//! ---
//! sphere_section: "03-persistence-logging"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Metrics collection and export utilities."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;
    let addr = listener.local_addr().unwrap_or(addr);

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics describing update runs.
#[derive(Clone, Debug)]
pub struct UpdaterMetrics {
    registry: SharedRegistry,
    runs_started: IntCounter,
    runs_succeeded: IntCounter,
    runs_failed: IntCounterVec,
    run_seconds: Histogram,
    percent: Gauge,
    build_info: GaugeVec,
}

impl UpdaterMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let runs_started = IntCounter::with_opts(Opts::new(
            "sphere_updates_runs_started_total",
            "Update runs accepted by the job controller",
        ))?;
        registry.register(Box::new(runs_started.clone()))?;

        let runs_succeeded = IntCounter::with_opts(Opts::new(
            "sphere_updates_runs_succeeded_total",
            "Update runs that reached 100 percent without error",
        ))?;
        registry.register(Box::new(runs_succeeded.clone()))?;

        let runs_failed = IntCounterVec::new(
            Opts::new(
                "sphere_updates_runs_failed_total",
                "Update runs that ended with an error, by failure kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(runs_failed.clone()))?;

        // apt runs on the appliance range from seconds to well over an hour.
        let buckets = prometheus::exponential_buckets(5.0, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let run_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sphere_updates_run_duration_seconds",
                "Wall-clock duration of finished update runs",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(run_seconds.clone()))?;

        let percent = Gauge::with_opts(Opts::new(
            "sphere_updates_progress_percent",
            "Latest published progress percent",
        ))?;
        registry.register(Box::new(percent.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "sphere_updates_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "git_sha"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            runs_started,
            runs_succeeded,
            runs_failed,
            run_seconds,
            percent,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_started(&self) {
        self.runs_started.inc();
    }

    pub fn record_success(&self, seconds: f64) {
        self.runs_succeeded.inc();
        self.run_seconds.observe(seconds);
    }

    pub fn record_failure(&self, kind: &str, seconds: f64) {
        self.runs_failed.with_label_values(&[kind]).inc();
        self.run_seconds.observe(seconds);
    }

    pub fn set_percent(&self, percent: f64) {
        self.percent.set(percent);
    }

    pub fn set_build_info(&self, version: &str, git_sha: &str) {
        self.build_info
            .with_label_values(&[version, git_sha])
            .set(1.0);
    }
}

pub use prometheus;
