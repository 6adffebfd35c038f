//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Update job orchestration and lifecycle management."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single external command.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started at all.
    #[error("could not start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// The program ran and exited unsuccessfully.
    #[error("`{command}` failed. Code: {code}")]
    Exit { command: String, code: i32 },
    /// The program was terminated by a signal and has no exit code.
    #[error("`{command}` was terminated by a signal")]
    Signalled { command: String },
    /// Waiting for the program failed.
    #[error("failed waiting for `{command}`: {reason}")]
    Wait { command: String, reason: String },
    /// The program outlived the configured command timeout and was killed.
    #[error("`{command}` did not finish within {after:?}")]
    Timeout { command: String, after: Duration },
}

impl ProcessError {
    /// Exit code reported by the platform, when there is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Failure while producing the list of available updates.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("unable to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Terminal failure of an update run. Its `Display` text becomes `Progress.error`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to enable disk writing: {0}")]
    Writability(#[source] ProcessError),
    #[error("Failed to restore read-only root: {0}")]
    ReadOnlyRestore(#[source] ProcessError),
    #[error("Failed to update cache: {0}")]
    CacheRefresh(#[source] ProcessError),
    #[error("Failed to get updatable packages: {0}")]
    Discovery(#[source] DiscoveryError),
    #[error("Failed to install {package}: {source}")]
    OverrideInstall {
        package: String,
        #[source]
        source: ProcessError,
    },
    #[error("Failed to install updates: {0}")]
    Install(#[source] ProcessError),
    #[error("Update cancelled")]
    Cancelled,
    #[error("Update worker aborted: {0}")]
    Aborted(String),
}

impl JobError {
    /// Stage label published alongside the error.
    pub fn description(&self) -> &'static str {
        match self {
            JobError::Writability(_) => "Failed to enable disk writing",
            JobError::OverrideInstall { .. } => "Failed running pre-install script",
            JobError::Cancelled => "Cancelled",
            _ => "Failed",
        }
    }

    /// Short machine-readable failure kind, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Writability(_) => "writability",
            JobError::ReadOnlyRestore(_) => "read_only_restore",
            JobError::CacheRefresh(_) => "cache_refresh",
            JobError::Discovery(_) => "discovery",
            JobError::OverrideInstall { .. } => "override_install",
            JobError::Install(_) => "install",
            JobError::Cancelled => "cancelled",
            JobError::Aborted(_) => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_exit_message_embeds_code() {
        let err = JobError::Install(ProcessError::Exit {
            command: "apt-get install -yy -q ninjasphere".into(),
            code: 100,
        });
        let message = err.to_string();
        assert!(message.starts_with("Failed to install updates"));
        assert!(message.contains("Code: 100"));
        assert_eq!(err.description(), "Failed");
    }

    #[test]
    fn descriptions_follow_failed_stage() {
        let spawn = || ProcessError::Spawn {
            command: "mount -o remount,rw /".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(
            JobError::Writability(spawn()).description(),
            "Failed to enable disk writing"
        );
        assert_eq!(
            JobError::OverrideInstall {
                package: "sphere-idspispopd".into(),
                source: spawn(),
            }
            .description(),
            "Failed running pre-install script"
        );
        assert_eq!(JobError::Cancelled.kind(), "cancelled");
    }
}
