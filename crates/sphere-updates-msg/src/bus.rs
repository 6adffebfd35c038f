//! ---
//! sphere_section: "02-messaging-ipc-data-model"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Status bus fan-out of update events to transports and the display."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::display::{ResultIcon, StatusDisplay};
use crate::{Message, Transport, UpdateEvent};

/// Snapshot of bus delivery counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusMetrics {
    /// Messages successfully handed to transports.
    pub sent: u64,
    /// Messages a transport refused.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BusMetrics {
        BusMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Fans updater events out to the status bus transports and the display.
///
/// Transport failures are logged and counted but never propagated: a broken
/// bus must not affect the update itself.
pub struct StatusBus {
    transports: Vec<Arc<dyn Transport>>,
    display: Option<Arc<dyn StatusDisplay>>,
    counters: Counters,
}

impl StatusBus {
    /// Construct a bus without transports or display.
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
            display: None,
            counters: Counters::default(),
        }
    }

    /// Register a transport for publish operations.
    pub fn register_transport<T>(&mut self, transport: Arc<T>)
    where
        T: Transport + 'static,
    {
        self.transports.push(transport as Arc<dyn Transport>);
    }

    /// Attach the display driver.
    pub fn attach_display<D>(&mut self, display: Arc<D>)
    where
        D: StatusDisplay + 'static,
    {
        self.display = Some(display as Arc<dyn StatusDisplay>);
    }

    /// Publish one event to every transport and mirror it on the display.
    ///
    /// The display receives a progress fraction for every non-terminal
    /// `progress` event and a result icon on `finished`.
    pub fn publish(&self, event: UpdateEvent) {
        if let Some(display) = &self.display {
            match &event {
                UpdateEvent::Progress(progress) if progress.running => {
                    display.set_progress(progress.fraction());
                }
                UpdateEvent::Finished { error } => {
                    let icon = if error.is_some() {
                        ResultIcon::Failed
                    } else {
                        ResultIcon::Succeeded
                    };
                    display.show_result(icon);
                }
                _ => {}
            }
        }

        let message = Message::new(event);
        debug!(
            message_id = %message.id,
            kind = message.kind(),
            schema_version = message.schema_version,
            "publishing status event"
        );
        for transport in &self.transports {
            if let Err(err) = transport.send(message.clone()) {
                warn!(transport = transport.name(), error = %err, "transport send failed");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Return the current delivery counters.
    pub fn metrics(&self) -> BusMetrics {
        self.counters.snapshot()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}
