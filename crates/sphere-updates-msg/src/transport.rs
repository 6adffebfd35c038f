//! ---
//! sphere_section: "02-messaging-ipc-data-model"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Transport abstraction towards the device status bus."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Message, Result};

/// Transport abstraction towards the device status bus.
pub trait Transport: Send + Sync {
    /// Send a message into the transport.
    fn send(&self, msg: Message) -> Result<()>;
    /// Receive the next message from the transport, if available.
    fn recv(&self) -> Option<Message>;
    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
}

/// In-memory transport backed by a mutex protected queue.
///
/// Used by tests and by the daemon when no external bus is attached.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    queue: Arc<Mutex<VecDeque<Message>>>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting to be received.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when no message is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, msg: Message) -> Result<()> {
        self.queue.lock().push_back(msg);
        Ok(())
    }

    fn recv(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
