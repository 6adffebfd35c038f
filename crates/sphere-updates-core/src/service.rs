//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Bridges the update channel onto the status bus."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::sync::Arc;

use sphere_updates_msg::{StatusBus, UpdateEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Outcome carried by a `finished` event.
pub type RunOutcome = Result<(), String>;

/// Forward events to `bus` until one run finishes, calling `observe` on each
/// event first. Returns `None` when the channel closes before a `finished`
/// event arrives.
pub async fn forward_until_finished<F>(
    events: &mut mpsc::Receiver<UpdateEvent>,
    bus: &StatusBus,
    mut observe: F,
) -> Option<RunOutcome>
where
    F: FnMut(&UpdateEvent),
{
    while let Some(event) = events.recv().await {
        observe(&event);
        let outcome = match &event {
            UpdateEvent::Finished { error } => Some(error.clone().map_or(Ok(()), Err)),
            _ => None,
        };
        bus.publish(event);
        if outcome.is_some() {
            return outcome;
        }
    }
    None
}

/// Forward every event to `bus` on a background task until the controller
/// is dropped.
pub fn spawn_status_pump(
    mut events: mpsc::Receiver<UpdateEvent>,
    bus: Arc<StatusBus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            bus.publish(event);
        }
        debug!("update channel closed; status pump stopping");
    })
}
