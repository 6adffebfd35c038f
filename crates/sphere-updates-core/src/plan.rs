//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Resolved commands and policy for one update controller."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use sphere_updates_common::{AppConfig, Mode, ProgressConfig};
use sphere_updates_msg::AvailableUpdate;
use thiserror::Error;

use crate::filter::PackageFilter;
use crate::process::CommandSpec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("commands.{0} must not be empty")]
    EmptyCommand(&'static str),
}

/// Where the raw `name\tcurrent\tavailable` records come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverySource {
    Command(CommandSpec),
    File(PathBuf),
}

/// What performs package installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallTarget {
    PackageManager { program: String },
    /// Replays recorded install output instead of installing.
    Fixture { upgrade_file: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemountCommands {
    pub writable: CommandSpec,
    pub read_only: CommandSpec,
}

/// Every external command a run may issue. Stages whose command is `None`
/// are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub refresh: Option<CommandSpec>,
    pub discovery: DiscoverySource,
    pub install: InstallTarget,
    pub autoremove: Option<CommandSpec>,
    pub repair: Option<CommandSpec>,
    pub remount: Option<RemountCommands>,
}

impl CommandPlan {
    pub fn from_config(config: &AppConfig) -> Result<Self, SettingsError> {
        let commands = &config.commands;
        if config.mode == Mode::Fixture {
            return Ok(Self {
                refresh: None,
                discovery: DiscoverySource::File(config.fixtures.updates_file.clone()),
                install: InstallTarget::Fixture {
                    upgrade_file: config.fixtures.upgrade_file.clone(),
                },
                autoremove: None,
                repair: None,
                remount: None,
            });
        }

        let discovery =
            CommandSpec::from_argv(&commands.discover).ok_or(SettingsError::EmptyCommand("discover"))?;
        let manager = &commands.package_manager;
        let root = commands.root.display().to_string();
        let remount = cfg!(target_os = "linux").then(|| RemountCommands {
            writable: CommandSpec::new(&commands.mount).args(["-o", "remount,rw", root.as_str()]),
            read_only: CommandSpec::new(&commands.mount).args(["-o", "remount,ro", root.as_str()]),
        });

        Ok(Self {
            refresh: Some(CommandSpec::new(manager).args(["update", "-q"])),
            discovery: DiscoverySource::Command(discovery),
            install: InstallTarget::PackageManager {
                program: manager.clone(),
            },
            autoremove: Some(CommandSpec::new(manager).args(["autoremove", "-y"])),
            repair: CommandSpec::from_argv(&commands.repair),
            remount,
        })
    }

    /// Command installing exactly `packages`, in order.
    pub fn install_command(&self, packages: &[AvailableUpdate]) -> CommandSpec {
        match &self.install {
            InstallTarget::PackageManager { program } => CommandSpec::new(program)
                .args(["install", "-yy", "-q"])
                .args(packages.iter().map(|update| update.name.clone()))
                .env("DEBIAN_FRONTEND", "noninteractive"),
            InstallTarget::Fixture { upgrade_file } => {
                CommandSpec::new("cat").arg(upgrade_file.display().to_string())
            }
        }
    }
}

/// Everything a [`crate::JobController`] needs besides its runner.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub plan: CommandPlan,
    pub filter: PackageFilter,
    pub core_package: String,
    pub override_package: Option<String>,
    pub progress: ProgressConfig,
    pub command_timeout: Option<Duration>,
}

impl JobSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, SettingsError> {
        Ok(Self {
            plan: CommandPlan::from_config(config)?,
            filter: PackageFilter::from_policy(&config.policy),
            core_package: config.policy.core_package.clone(),
            override_package: config.policy.override_package.clone(),
            progress: config.progress.clone(),
            command_timeout: config.job.command_timeout,
        })
    }
}
