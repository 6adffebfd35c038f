//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Root filesystem writability window and package database repair."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::ProcessError;
use crate::plan::{CommandPlan, RemountCommands};
use crate::process::{run_lines, CommandSpec, ProcessRunner};

/// Toggles the root filesystem between read-only and read-write.
///
/// Without remount commands (fixture mode, non-Linux hosts) acquiring and
/// releasing succeed without doing anything.
#[derive(Clone)]
pub struct SafetyGate {
    runner: Arc<dyn ProcessRunner>,
    remount: Option<RemountCommands>,
    repair: Option<CommandSpec>,
    limit: Option<Duration>,
}

impl SafetyGate {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        plan: &CommandPlan,
        limit: Option<Duration>,
    ) -> Self {
        Self {
            runner,
            remount: plan.remount.clone(),
            repair: plan.repair.clone(),
            limit,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.remount.is_none()
    }

    /// Remount the root read-write. The returned guard restores read-only
    /// mode exactly once, through [`WritableGuard::release`] or on drop.
    pub async fn acquire_writable(&self) -> Result<WritableGuard, ProcessError> {
        if let Some(remount) = &self.remount {
            info!(command = %remount.writable, "enabling disk writing");
            self.run(&remount.writable).await?;
        }
        Ok(WritableGuard {
            runner: Arc::clone(&self.runner),
            read_only: self.remount.as_ref().map(|r| r.read_only.clone()),
            limit: self.limit,
            released: false,
        })
    }

    /// Finish interrupted package configuration. Callers treat failure as
    /// non-fatal.
    pub async fn repair(&self) -> Result<(), ProcessError> {
        let Some(repair) = &self.repair else {
            return Ok(());
        };
        info!(command = %repair, "repairing package database");
        self.run(repair).await
    }

    async fn run(&self, command: &CommandSpec) -> Result<(), ProcessError> {
        run_lines(self.runner.as_ref(), command, self.limit, |line| {
            debug!(command = %command, line, "output");
        })
        .await
    }
}

/// Scoped write access to the root filesystem.
#[must_use = "dropping the guard immediately restores read-only mode"]
pub struct WritableGuard {
    runner: Arc<dyn ProcessRunner>,
    read_only: Option<CommandSpec>,
    limit: Option<Duration>,
    released: bool,
}

impl WritableGuard {
    /// Remount read-only and wait for the result.
    pub async fn release(mut self) -> Result<(), ProcessError> {
        self.released = true;
        let Some(command) = self.read_only.take() else {
            return Ok(());
        };
        info!(command = %command, "disabling disk writing");
        run_lines(self.runner.as_ref(), &command, self.limit, |line| {
            debug!(command = %command, line, "output");
        })
        .await
    }
}

impl Drop for WritableGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let Some(command) = self.read_only.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(command = %command, "no runtime to restore read-only root");
            return;
        };
        warn!(command = %command, "restoring read-only root from drop");
        let runner = Arc::clone(&self.runner);
        let limit = self.limit;
        runtime.spawn(async move {
            if let Err(err) = run_lines(runner.as_ref(), &command, limit, |_| {}).await {
                error!(command = %command, error = %err, "failed to restore read-only root");
            }
        });
    }
}
