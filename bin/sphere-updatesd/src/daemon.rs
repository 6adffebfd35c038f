//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "binary"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Long-running host for the update controller."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use sphere_updates_common::{AppConfig, VersionInfo};
use sphere_updates_core::{spawn_status_pump, JobController, JobSettings, ProcessRunner};
use sphere_updates_metrics::{new_registry, spawn_http_server, UpdaterMetrics};
use sphere_updates_msg::{LogDisplay, StatusBus};
use tokio::signal;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub async fn run(
    config: AppConfig,
    settings: JobSettings,
    runner: Arc<dyn ProcessRunner>,
    version: VersionInfo,
) -> Result<()> {
    let registry = new_registry();
    let metrics = UpdaterMetrics::new(registry.clone())?;
    metrics.set_build_info(&version.semver, &version.git_sha);

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let (controller, events) = JobController::with_metrics(settings, runner, Some(metrics));
    let mut bus = StatusBus::new();
    bus.attach_display(Arc::new(LogDisplay));
    let bus = Arc::new(bus);
    let pump = spawn_status_pump(events, Arc::clone(&bus));

    info!(version = %version.banner(), mode = ?config.mode, "daemon running");
    if config.job.run_on_start && !controller.start() {
        warn!("initial update was not started");
    }

    let mut poll = config.job.poll_interval.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                let reason = signal?;
                info!(signal = reason, "shutting down");
                break;
            }
            _ = next_poll(&mut poll) => {
                if controller.start() {
                    info!("scheduled update started");
                } else {
                    debug!("scheduled update skipped; a run is in progress");
                }
            }
        }
    }

    if controller.cancel() {
        info!("waiting for the current update to stop");
    }
    controller.wait().await;
    drop(controller);
    if let Err(err) = pump.await {
        warn!(error = %err, "status pump task failed");
    }
    let delivery = bus.metrics();
    info!(sent = delivery.sent, dropped = delivery.dropped, "status bus drained");

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves with the name of the first termination signal received.
pub async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminated = async move {
        terminate.recv().await;
    };
    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        received = signal::ctrl_c() => {
            received?;
            Ok("ctrl-c")
        }
        _ = terminated => Ok("SIGTERM"),
    }
}
