//! ---
//! sphere_section: "02-messaging-ipc-data-model"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Front-panel display seam and its logging and recording drivers."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

/// Result indicator shown on the front panel when a run finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultIcon {
    /// Every package installed.
    Succeeded,
    /// The run ended with an error.
    Failed,
}

impl ResultIcon {
    /// Icon name understood by the display driver.
    pub fn name(&self) -> &'static str {
        match self {
            ResultIcon::Succeeded => "update-succeeded",
            ResultIcon::Failed => "update-failed",
        }
    }
}

/// Seam towards the physical display driver.
pub trait StatusDisplay: Send + Sync {
    /// Draw a progress bar at `fraction` (0.0 to 1.0).
    fn set_progress(&self, fraction: f64);
    /// Show the final result icon.
    fn show_result(&self, icon: ResultIcon);
}

/// Display sink that only logs. Used on hardware without a panel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn set_progress(&self, fraction: f64) {
        tracing::debug!(fraction, "display progress");
    }

    fn show_result(&self, icon: ResultIcon) {
        info!(icon = icon.name(), "display result");
    }
}

/// Call observed by a [`RecordingDisplay`].
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayCall {
    /// `set_progress` with the supplied fraction.
    Progress(f64),
    /// `show_result` with the supplied icon.
    Result(ResultIcon),
}

/// In-memory display capturing every call, for tests and diagnostics.
#[derive(Debug, Default, Clone)]
pub struct RecordingDisplay {
    calls: Arc<Mutex<Vec<DisplayCall>>>,
}

impl RecordingDisplay {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls recorded so far, oldest first.
    pub fn calls(&self) -> Vec<DisplayCall> {
        self.calls.lock().clone()
    }
}

impl StatusDisplay for RecordingDisplay {
    fn set_progress(&self, fraction: f64) {
        self.calls.lock().push(DisplayCall::Progress(fraction));
    }

    fn show_result(&self, icon: ResultIcon) {
        self.calls.lock().push(DisplayCall::Result(icon));
    }
}
