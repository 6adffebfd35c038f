//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Package selection policy over discovered updates."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use sphere_updates_common::PolicyConfig;
use sphere_updates_msg::AvailableUpdate;
use tracing::{debug, trace};

/// Parse discovery output: one `name\tcurrent\tavailable` record per line.
/// Blank lines and rows with any other field count are skipped.
pub fn parse_records<'a, I>(lines: I) -> Vec<AvailableUpdate>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                return None;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            match fields.as_slice() {
                [name, current, available] => Some(AvailableUpdate::new(*name, *current, *available)),
                _ => {
                    trace!(line, "skipping malformed discovery record");
                    None
                }
            }
        })
        .collect()
}

/// Keeps device-namespace updates and drops the updater's own packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFilter {
    namespace_marker: String,
    excluded: Vec<String>,
}

impl PackageFilter {
    pub fn new<I, S>(namespace_marker: impl Into<String>, excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace_marker: namespace_marker.into(),
            excluded: excluded.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self::new(&policy.namespace_marker, policy.excluded_packages.iter().cloned())
    }

    pub fn admits(&self, update: &AvailableUpdate) -> bool {
        update.available_version.contains(&self.namespace_marker)
            && !self.excluded.iter().any(|name| *name == update.name)
    }

    pub fn apply(&self, discovered: Vec<AvailableUpdate>) -> Vec<AvailableUpdate> {
        let total = discovered.len();
        let kept: Vec<AvailableUpdate> = discovered
            .into_iter()
            .filter(|update| self.admits(update))
            .collect();
        debug!(discovered = total, kept = kept.len(), "filtered available updates");
        kept
    }
}

/// Append a bare entry for `core_package` unless the set already names it.
pub fn force_include(updates: &mut Vec<AvailableUpdate>, core_package: &str) {
    if !updates.iter().any(|update| update.name == core_package) {
        updates.push(AvailableUpdate::named(core_package));
    }
}
