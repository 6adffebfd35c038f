//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Update job orchestration and lifecycle management."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
//! The update job controller.
//!
//! A run is one linear pass over the stages below, executed on a background
//! task. Every progress mutation is published on a capacity-1 channel and
//! the worker waits for the consumer to take each event, so consumers see
//! every state in order and the worker is never more than one event ahead.
//!
//! ```text
//! Idle -> Writable -> Repairing -> RefreshingCache -> Discovering
//!      -> [OverrideInstalling -> Rediscovering] -> AutoRemoving
//!      -> Installing -> ReadOnly -> Finished | Failed
//! ```
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use sphere_updates_metrics::UpdaterMetrics;
use sphere_updates_msg::{AvailableUpdate, Progress, UpdateEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::discovery::discover_install_set;
use crate::error::{DiscoveryError, JobError, ProcessError};
use crate::estimator::{CacheRefreshEstimator, InstallEstimator, ProgressEstimator};
use crate::plan::JobSettings;
use crate::process::{run_lines, CommandSpec, ProcessRunner, TimeBudget};
use crate::safety::SafetyGate;

/// Capacity of the update channel returned by [`JobController::new`].
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

const DESCRIPTION_LOOKING: &str = "Looking for updates";
const DESCRIPTION_PROCESSING: &str = "Processing available updates";
const DESCRIPTION_PRE_INSTALL: &str = "Running pre-install script";
const DESCRIPTION_INSTALLING: &str = "Installing updates";
const DESCRIPTION_FINISHED: &str = "Finished";

/// Stage of the current or most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStage {
    Idle,
    Writable,
    Repairing,
    RefreshingCache,
    Discovering,
    OverrideInstalling,
    Rediscovering,
    AutoRemoving,
    Installing,
    ReadOnly,
    Finished,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Idle => "idle",
            JobStage::Writable => "writable",
            JobStage::Repairing => "repairing",
            JobStage::RefreshingCache => "refreshing_cache",
            JobStage::Discovering => "discovering",
            JobStage::OverrideInstalling => "override_installing",
            JobStage::Rediscovering => "rediscovering",
            JobStage::AutoRemoving => "auto_removing",
            JobStage::Installing => "installing",
            JobStage::ReadOnly => "read_only",
            JobStage::Finished => "finished",
            JobStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Finished | JobStage::Failed)
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct JobState {
    progress: Progress,
    stage: JobStage,
    /// Held from `start` until the worker has published its last event.
    busy: bool,
}

struct Shared {
    state: Mutex<JobState>,
    events: mpsc::Sender<UpdateEvent>,
    metrics: Option<UpdaterMetrics>,
}

impl Shared {
    fn snapshot(&self) -> Progress {
        self.state.lock().progress.clone()
    }

    fn enter(&self, stage: JobStage) {
        self.state.lock().stage = stage;
        info!(stage = stage.as_str(), "update stage");
    }

    async fn publish(&self, event: UpdateEvent) {
        let name = event.name();
        if self.events.send(event).await.is_err() {
            debug!(event = name, "update channel closed; event dropped");
        }
    }

    /// Raise `percent` (never lowering it) and replace the description,
    /// publishing a snapshot when either changed.
    async fn advance(&self, percent: Option<f64>, description: Option<&str>) {
        let snapshot = {
            let mut state = self.state.lock();
            let progress = &mut state.progress;
            let mut changed = false;
            if let Some(percent) = percent.map(|p| p.clamp(0.0, 100.0)) {
                if percent > progress.percent {
                    progress.percent = percent;
                    changed = true;
                }
            }
            if let Some(description) = description {
                if progress.description != description {
                    progress.description = description.to_owned();
                    changed = true;
                }
            }
            if !changed {
                return;
            }
            progress.refresh_running_time(Utc::now());
            progress.clone()
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_percent(snapshot.percent);
        }
        self.publish(UpdateEvent::Progress(snapshot)).await;
    }

    async fn conclude(&self, outcome: Result<(), JobError>, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        let snapshot = {
            let mut state = self.state.lock();
            let progress = &mut state.progress;
            progress.running = false;
            match &outcome {
                Ok(()) => {
                    progress.percent = 100.0;
                    progress.description = DESCRIPTION_FINISHED.to_owned();
                }
                Err(err) => {
                    progress.description = err.description().to_owned();
                    progress.error = Some(err.to_string());
                }
            }
            progress.refresh_running_time(Utc::now());
            state.stage = if outcome.is_ok() {
                JobStage::Finished
            } else {
                JobStage::Failed
            };
            state.progress.clone()
        };

        match &outcome {
            Ok(()) => {
                info!(elapsed_secs = elapsed, "update finished");
                if let Some(metrics) = &self.metrics {
                    metrics.record_success(elapsed);
                }
            }
            Err(err) => {
                error!(kind = err.kind(), error = %err, percent = snapshot.percent, "update failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(err.kind(), elapsed);
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_percent(snapshot.percent);
        }

        let error = snapshot.error.clone();
        self.publish(UpdateEvent::Progress(snapshot)).await;
        self.publish(UpdateEvent::Finished { error }).await;
        self.state.lock().busy = false;
    }
}

/// Owns the [`Progress`] record and runs update jobs one at a time.
pub struct JobController {
    shared: Arc<Shared>,
    runner: Arc<dyn ProcessRunner>,
    settings: Arc<JobSettings>,
    cancel: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobController {
    /// Create a controller and the receiving end of its update channel.
    pub fn new(
        settings: JobSettings,
        runner: Arc<dyn ProcessRunner>,
    ) -> (Self, mpsc::Receiver<UpdateEvent>) {
        Self::with_metrics(settings, runner, None)
    }

    pub fn with_metrics(
        settings: JobSettings,
        runner: Arc<dyn ProcessRunner>,
        metrics: Option<UpdaterMetrics>,
    ) -> (Self, mpsc::Receiver<UpdateEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cancel, _) = watch::channel(false);
        let controller = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(JobState {
                    progress: Progress::default(),
                    stage: JobStage::Idle,
                    busy: false,
                }),
                events,
                metrics,
            }),
            runner,
            settings: Arc::new(settings),
            cancel,
            worker: Mutex::new(None),
        };
        (controller, receiver)
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Begin a run on a background task.
    ///
    /// Returns `false` without touching any state when a run is already in
    /// progress or no Tokio runtime is available.
    pub fn start(&self) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("update start requested outside a tokio runtime");
            return false;
        };
        {
            let mut state = self.shared.state.lock();
            if state.busy {
                debug!(stage = state.stage.as_str(), "update already running; start rejected");
                return false;
            }
            state.busy = true;
            state.stage = JobStage::Idle;
            let mut progress = Progress::started_at(Utc::now());
            progress.description = DESCRIPTION_LOOKING.to_owned();
            state.progress = progress;
        }
        self.cancel.send_replace(false);
        if let Some(metrics) = &self.shared.metrics {
            metrics.inc_started();
            metrics.set_percent(0.0);
        }
        info!("update run started");

        let run = JobRun {
            shared: Arc::clone(&self.shared),
            runner: Arc::clone(&self.runner),
            gate: SafetyGate::new(
                Arc::clone(&self.runner),
                &self.settings.plan,
                self.settings.command_timeout,
            ),
            settings: Arc::clone(&self.settings),
            cancel: self.cancel.subscribe(),
        };
        *self.worker.lock() = Some(runtime.spawn(run.drive()));
        true
    }

    /// Current snapshot; `running_time` is recomputed while a run is live.
    pub fn progress(&self) -> Progress {
        let mut progress = self.shared.snapshot();
        if progress.running {
            progress.refresh_running_time(Utc::now());
        }
        progress
    }

    pub fn stage(&self) -> JobStage {
        self.shared.state.lock().stage
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().busy
    }

    /// Ask the current run to stop at the next stage boundary. Returns
    /// `false` when nothing is running.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        info!("update cancellation requested");
        self.cancel.send_replace(true);
        true
    }

    /// Wait until the current run, if any, has published its last event.
    ///
    /// Events must be consumed concurrently or this never completes.
    pub async fn wait(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "update worker task failed");
            }
        }
    }

    /// The set a run would install right now, without mutating anything.
    pub async fn preview(&self) -> Result<Vec<AvailableUpdate>, DiscoveryError> {
        discover_install_set(self.runner.as_ref(), &self.settings).await
    }
}

/// State owned by one run's worker task.
#[derive(Clone)]
struct JobRun {
    shared: Arc<Shared>,
    runner: Arc<dyn ProcessRunner>,
    gate: SafetyGate,
    settings: Arc<JobSettings>,
    cancel: watch::Receiver<bool>,
}

impl JobRun {
    async fn drive(self) {
        let started = Instant::now();
        let shared = Arc::clone(&self.shared);
        shared.publish(UpdateEvent::Started).await;
        shared.publish(UpdateEvent::Progress(shared.snapshot())).await;

        // A panic while acquiring or releasing the root still ends the run
        // with a terminal event.
        let outcome = worker_outcome(tokio::spawn(self.execute()).await);
        shared.conclude(outcome, started).await;
    }

    async fn execute(self) -> Result<(), JobError> {
        self.shared.enter(JobStage::Writable);
        let guard = self
            .gate
            .acquire_writable()
            .await
            .map_err(JobError::Writability)?;

        // Read-only is restored before the terminal event even when a stage
        // panics.
        let stages = self.clone();
        let outcome = worker_outcome(tokio::spawn(async move { stages.mutate().await }).await);

        self.shared.enter(JobStage::ReadOnly);
        let restored = guard.release().await;
        match (outcome, restored) {
            (Err(err), restored) => {
                if let Err(restore) = restored {
                    error!(error = %restore, "failed to restore read-only root");
                }
                Err(err)
            }
            (Ok(()), Err(restore)) => Err(JobError::ReadOnlyRestore(restore)),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn mutate(&self) -> Result<(), JobError> {
        let settings = Arc::clone(&self.settings);
        let plan = &settings.plan;

        self.shared.enter(JobStage::Repairing);
        if let Err(err) = self.gate.repair().await {
            warn!(error = %err, "package database repair failed; continuing");
        }

        self.checkpoint()?;
        self.shared.enter(JobStage::RefreshingCache);
        if let Some(refresh) = &plan.refresh {
            let mut estimator = CacheRefreshEstimator::from_config(&settings.progress);
            self.stream(JobStage::RefreshingCache, refresh, Some(&mut estimator))
                .await
                .map_err(JobError::CacheRefresh)?;
        }

        self.checkpoint()?;
        self.shared.enter(JobStage::Discovering);
        self.shared
            .advance(
                Some(settings.progress.discovery_checkpoint),
                Some(DESCRIPTION_PROCESSING),
            )
            .await;
        let mut updates = self.discover().await?;

        let pending_override = settings
            .override_package
            .as_deref()
            .filter(|name| updates.iter().any(|update| update.name == *name));
        if let Some(package) = pending_override {
            self.checkpoint()?;
            self.shared.enter(JobStage::OverrideInstalling);
            self.shared
                .advance(None, Some(DESCRIPTION_PRE_INSTALL))
                .await;
            info!(package, "installing override package alone");
            let command = plan.install_command(&[AvailableUpdate::named(package)]);
            self.stream(JobStage::OverrideInstalling, &command, None)
                .await
                .map_err(|source| JobError::OverrideInstall {
                    package: package.to_owned(),
                    source,
                })?;

            self.shared.enter(JobStage::Rediscovering);
            updates = self.discover().await?;
            updates.retain(|update| update.name != package);
        }

        self.checkpoint()?;
        self.shared.enter(JobStage::AutoRemoving);
        if let Some(autoremove) = &plan.autoremove {
            let outcome = run_lines(
                self.runner.as_ref(),
                autoremove,
                settings.command_timeout,
                |line| debug!(stage = JobStage::AutoRemoving.as_str(), line, "package manager output"),
            )
            .await;
            if let Err(err) = outcome {
                warn!(error = %err, "auto-remove failed; continuing");
            }
        }

        self.checkpoint()?;
        self.shared.enter(JobStage::Installing);
        self.shared
            .advance(
                Some(settings.progress.install_baseline),
                Some(DESCRIPTION_INSTALLING),
            )
            .await;
        let names: Vec<&str> = updates.iter().map(|update| update.name.as_str()).collect();
        info!(packages = ?names, "installing updates");
        let mut estimator = InstallEstimator::from_config(&settings.progress, updates.len());
        let command = plan.install_command(&updates);
        self.stream(JobStage::Installing, &command, Some(&mut estimator))
            .await
            .map_err(JobError::Install)?;
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<AvailableUpdate>, JobError> {
        let updates = discover_install_set(self.runner.as_ref(), &self.settings)
            .await
            .map_err(JobError::Discovery)?;
        info!(count = updates.len(), "updates selected");
        Ok(updates)
    }

    /// Run `command`, logging each output line and feeding it to `estimator`.
    /// The command timeout covers the process only, not event delivery.
    async fn stream(
        &self,
        stage: JobStage,
        command: &CommandSpec,
        mut estimator: Option<&mut (dyn ProgressEstimator + '_)>,
    ) -> Result<(), ProcessError> {
        let mut budget = TimeBudget::new(self.settings.command_timeout);
        let mut handle = budget.charge(command, self.runner.spawn(command)).await??;
        while let Some(line) = budget.charge(command, handle.next_line()).await? {
            debug!(stage = stage.as_str(), line = %line, "package manager output");
            if let Some(estimator) = estimator.as_deref_mut() {
                let percent = estimator.observe(&line);
                self.shared.advance(Some(percent), None).await;
            }
        }
        budget.charge(command, handle.wait()).await?
    }

    fn checkpoint(&self) -> Result<(), JobError> {
        if *self.cancel.borrow() {
            warn!("update cancelled at stage boundary");
            return Err(JobError::Cancelled);
        }
        Ok(())
    }
}

fn worker_outcome(joined: Result<Result<(), JobError>, JoinError>) -> Result<(), JobError> {
    match joined {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => Err(JobError::Aborted("worker panicked".into())),
        Err(err) => Err(JobError::Aborted(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{CommandPlan, DiscoverySource, InstallTarget, RemountCommands};
    use crate::filter::PackageFilter;
    use crate::scripted::ScriptedRunner;
    use sphere_updates_common::ProgressConfig;

    fn settings() -> JobSettings {
        JobSettings {
            plan: CommandPlan {
                refresh: Some(CommandSpec::new("apt-get").args(["update", "-q"])),
                discovery: DiscoverySource::Command(CommandSpec::new("discover")),
                install: InstallTarget::PackageManager {
                    program: "apt-get".into(),
                },
                autoremove: Some(CommandSpec::new("apt-get").args(["autoremove", "-y"])),
                repair: Some(CommandSpec::new("dpkg").args(["--configure", "-a"])),
                remount: Some(RemountCommands {
                    writable: CommandSpec::new("mount").args(["-o", "remount,rw", "/"]),
                    read_only: CommandSpec::new("mount").args(["-o", "remount,ro", "/"]),
                }),
            },
            filter: PackageFilter::new("spheramid", ["sphere-updates"]),
            core_package: "ninjasphere".into(),
            override_package: Some("sphere-idspispopd".into()),
            progress: ProgressConfig::default(),
            command_timeout: None,
        }
    }

    async fn drain(mut events: mpsc::Receiver<UpdateEvent>) -> Vec<UpdateEvent> {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, UpdateEvent::Finished { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(JobStage::OverrideInstalling.to_string(), "override_installing");
        assert!(JobStage::Failed.is_terminal());
        assert!(!JobStage::Installing.is_terminal());
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let runner = ScriptedRunner::new();
        let (controller, events) = JobController::new(settings(), Arc::new(runner));
        assert!(controller.start());
        let before = controller.progress();
        assert!(!controller.start());
        assert_eq!(controller.progress().start_time, before.start_time);

        let seen = drain(events).await;
        controller.wait().await;
        let started = seen
            .iter()
            .filter(|event| matches!(event, UpdateEvent::Started))
            .count();
        assert_eq!(started, 1);
        assert!(!controller.is_running());
    }

    #[test]
    fn start_outside_runtime_is_rejected() {
        let (controller, _events) = JobController::new(settings(), Arc::new(ScriptedRunner::new()));
        assert!(!controller.start());
        assert!(!controller.is_running());
        assert_eq!(controller.progress(), Progress::default());
    }

    #[tokio::test]
    async fn cancel_before_refresh_restores_read_only() {
        let runner = ScriptedRunner::new();
        let (controller, events) = JobController::new(settings(), Arc::new(runner.clone()));
        assert!(!controller.cancel());
        assert!(controller.start());
        assert!(controller.cancel());

        let seen = drain(events).await;
        controller.wait().await;
        assert_eq!(
            seen.last(),
            Some(&UpdateEvent::Finished {
                error: Some("Update cancelled".into())
            })
        );
        assert_eq!(controller.progress().description, "Cancelled");
        assert_eq!(controller.stage(), JobStage::Failed);
        assert_eq!(runner.count_matching(&["apt-get", "update"]), 0);
        assert_eq!(runner.count_matching(&["mount", "-o", "remount,ro"]), 1);
    }
}
