//! ---
//! sphere_section: "02-messaging-ipc-data-model"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Update progress model, status events, and bus message envelope."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version broadcast alongside every message payload.
pub const SCHEMA_VERSION: u16 = 1;

/// State of the current (or most recent) update run.
///
/// Consumers only ever see clones of this record; the job controller owns the
/// live copy. Within a run `percent` never decreases, and once `error` is set
/// `running` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// True from job start until the run reaches a terminal state.
    pub running: bool,
    /// Set once when the run starts. `None` before the first run.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Whole seconds since `start_time`, refreshed by [`Progress::refresh_running_time`].
    #[serde(default)]
    pub running_time: i64,
    /// Human-readable label for the current stage.
    #[serde(default)]
    pub description: String,
    /// Completion estimate in `[0, 100]`.
    pub percent: f64,
    /// Terminal failure message, if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Progress {
    /// Fresh record for a run starting at `now`.
    pub fn started_at(now: DateTime<Utc>) -> Self {
        Self {
            running: true,
            start_time: Some(now),
            running_time: 0,
            description: String::new(),
            percent: 0.0,
            error: None,
        }
    }

    /// Recompute `running_time` relative to `now`.
    pub fn refresh_running_time(&mut self, now: DateTime<Utc>) {
        self.running_time = self
            .start_time
            .map(|start| (now - start).num_seconds().max(0))
            .unwrap_or_default();
    }

    /// `percent` scaled to `[0.0, 1.0]` for display drivers.
    pub fn fraction(&self) -> f64 {
        (self.percent / 100.0).clamp(0.0, 1.0)
    }

    /// True once the run has ended, either finished or failed.
    pub fn is_terminal(&self) -> bool {
        self.start_time.is_some() && !self.running
    }

    /// True when the run completed without error.
    pub fn succeeded(&self) -> bool {
        self.is_terminal() && self.error.is_none() && self.percent >= 100.0
    }
}

/// One package the package manager reports as upgradable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableUpdate {
    /// Package name as understood by the package manager.
    pub name: String,
    /// Installed version, empty when unknown or not installed.
    #[serde(default)]
    pub current_version: String,
    /// Candidate version, empty for synthetic entries.
    #[serde(default)]
    pub available_version: String,
}

impl AvailableUpdate {
    /// Construct an update row from its three discovery fields.
    pub fn new(
        name: impl Into<String>,
        current_version: impl Into<String>,
        available_version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            current_version: current_version.into(),
            available_version: available_version.into(),
        }
    }

    /// Entry carrying only a package name, used for forced installs.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "", "")
    }
}

impl fmt::Display for AvailableUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.available_version.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(
                f,
                "{} ({} -> {})",
                self.name, self.current_version, self.available_version
            )
        }
    }
}

/// Events emitted by the job controller, in order, for every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// A run was accepted and is about to begin.
    Started,
    /// A progress snapshot, including the terminal one.
    Progress(Progress),
    /// The run ended; carries the terminal error if it failed.
    Finished {
        /// Failure message, `None` on success.
        error: Option<String>,
    },
}

impl UpdateEvent {
    /// Bus event name.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::Started => "started",
            UpdateEvent::Progress(_) => "progress",
            UpdateEvent::Finished { .. } => "finished",
        }
    }
}

/// Envelope placed on the status bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier for deduplication and tracing.
    pub id: Uuid,
    /// Version of the schema used by the payload.
    pub schema_version: u16,
    /// Timestamp when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Event carried by the message.
    pub payload: UpdateEvent,
}

impl Message {
    /// Construct a new message envelope around the provided event.
    pub fn new(payload: UpdateEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Event name of the payload.
    pub fn kind(&self) -> &'static str {
        self.payload.name()
    }
}
