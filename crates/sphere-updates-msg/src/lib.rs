//! ---
//! sphere_section: "02-messaging-ipc-data-model"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Progress data model and status bus helpers."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Data published by the updater: [`Progress`] snapshots wrapped in
//! [`UpdateEvent`]s, the [`Message`] envelope placed on the status bus, and the
//! seams towards the bus transport and the front-panel display.

pub mod bus;
pub mod display;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised while handing events to external collaborators.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The transport refused or could not deliver the message.
    #[error("transport {transport} rejected message: {reason}")]
    Rejected {
        /// Name of the transport reporting the failure.
        transport: &'static str,
        /// Human readable cause.
        reason: String,
    },
}

pub use bus::{BusMetrics, StatusBus};
pub use display::{DisplayCall, LogDisplay, RecordingDisplay, ResultIcon, StatusDisplay};
pub use transport::{InMemoryTransport, Transport};
pub use types::{AvailableUpdate, Message, Progress, UpdateEvent, SCHEMA_VERSION};

#[cfg(test)]
mod tests {
    use super::MessagingError;

    #[test]
    fn rejected_names_transport_and_reason() {
        let err = MessagingError::Rejected {
            transport: "in-memory",
            reason: "queue closed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "transport in-memory rejected message: queue closed"
        );
    }

    #[test]
    fn module_headers_carry_distinct_descriptions() {
        let sources = [
            include_str!("lib.rs"),
            include_str!("bus.rs"),
            include_str!("display.rs"),
            include_str!("transport.rs"),
            include_str!("types.rs"),
        ];
        let mut descriptions: Vec<&str> = sources
            .iter()
            .filter_map(|source| {
                source
                    .lines()
                    .find(|line| line.starts_with("//! sphere_description:"))
            })
            .collect();
        assert_eq!(descriptions.len(), sources.len());
        descriptions.sort_unstable();
        descriptions.dedup();
        assert_eq!(descriptions.len(), sources.len(), "{descriptions:?}");
    }
}
