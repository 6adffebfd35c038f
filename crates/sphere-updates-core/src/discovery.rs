//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Discovery of available package updates."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::time::Duration;

use sphere_updates_msg::AvailableUpdate;
use tracing::debug;

use crate::error::DiscoveryError;
use crate::filter::{force_include, parse_records};
use crate::plan::{DiscoverySource, JobSettings};
use crate::process::{run_lines, ProcessRunner};

/// Unfiltered records from `source`.
pub async fn discover_raw(
    runner: &dyn ProcessRunner,
    source: &DiscoverySource,
    limit: Option<Duration>,
) -> Result<Vec<AvailableUpdate>, DiscoveryError> {
    match source {
        DiscoverySource::Command(command) => {
            let mut lines = Vec::new();
            run_lines(runner, command, limit, |line| {
                debug!(stage = "discovering", line, "discovery output");
                lines.push(line.to_owned());
            })
            .await?;
            Ok(parse_records(lines.iter().map(String::as_str)))
        }
        DiscoverySource::File(path) => {
            let raw = tokio::fs::read(path)
                .await
                .map_err(|source| DiscoveryError::Read {
                    path: path.clone(),
                    source,
                })?;
            Ok(parse_records(String::from_utf8_lossy(&raw).lines()))
        }
    }
}

/// Filtered updates with the forced core entry appended: the set a run
/// would install.
pub async fn discover_install_set(
    runner: &dyn ProcessRunner,
    settings: &JobSettings,
) -> Result<Vec<AvailableUpdate>, DiscoveryError> {
    let raw = discover_raw(runner, &settings.plan.discovery, settings.command_timeout).await?;
    let mut updates = settings.filter.apply(raw);
    force_include(&mut updates, &settings.core_package);
    Ok(updates)
}
