//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Update job orchestrator crate root."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
//! Drives the package manager through a staged update run, turning its
//! output into a monotonic progress signal while keeping the root
//! filesystem read-only outside the install window.

pub mod discovery;
pub mod error;
pub mod estimator;
pub mod filter;
pub mod job;
pub mod plan;
pub mod process;
pub mod safety;
pub mod scripted;
pub mod service;

pub use discovery::{discover_install_set, discover_raw};
pub use error::{DiscoveryError, JobError, ProcessError};
pub use estimator::{CacheRefreshEstimator, InstallEstimator, ProgressEstimator, INSTALL_CEILING};
pub use filter::{force_include, parse_records, PackageFilter};
pub use job::{JobController, JobStage, EVENT_CHANNEL_CAPACITY};
pub use plan::{CommandPlan, DiscoverySource, InstallTarget, JobSettings, RemountCommands, SettingsError};
pub use process::{
    run_lines, CommandSpec, ProcessHandle, ProcessRunner, TimeBudget, TokioProcessRunner,
    EXIT_DRAIN_GRACE,
};
pub use safety::{SafetyGate, WritableGuard};
pub use scripted::{ScriptedExit, ScriptedReply, ScriptedRunner};
pub use service::{forward_until_finished, spawn_status_pump, RunOutcome};
