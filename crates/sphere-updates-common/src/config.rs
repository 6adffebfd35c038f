//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Shared primitives and utilities for the updater runtime."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Awk filter turning an `apt-get -s dist-upgrade` simulation into
/// `name\tcurrent\tavailable` records.
pub const DEFAULT_DISCOVERY_PIPELINE: &str =
    r#"apt-get -s dist-upgrade | awk -F'[][() ]+' '/^Inst/{printf "%s\t%s\t%s\n", $2,$3,$4}'"#;

fn default_mode() -> Mode {
    if cfg!(target_os = "linux") {
        Mode::System
    } else {
        Mode::Fixture
    }
}

fn default_namespace_marker() -> String {
    "spheramid".to_owned()
}

fn default_core_package() -> String {
    "ninjasphere".to_owned()
}

fn default_override_package() -> Option<String> {
    Some("sphere-idspispopd".to_owned())
}

fn default_excluded_packages() -> Vec<String> {
    vec!["sphere-updates".to_owned(), "sphere-setup-assistant".to_owned()]
}

fn default_package_manager() -> String {
    "apt-get".to_owned()
}

fn default_discover_command() -> Vec<String> {
    vec![
        "/bin/sh".to_owned(),
        "-c".to_owned(),
        DEFAULT_DISCOVERY_PIPELINE.to_owned(),
    ]
}

fn default_repair_command() -> Vec<String> {
    vec!["dpkg".to_owned(), "--configure".to_owned(), "-a".to_owned()]
}

fn default_mount_binary() -> String {
    "mount".to_owned()
}

fn default_root_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_updates_file() -> PathBuf {
    PathBuf::from("./updates.txt")
}

fn default_upgrade_file() -> PathBuf {
    PathBuf::from("./upgrade.txt")
}

fn default_cache_expected_lines() -> f64 {
    45.0
}

fn default_cache_budget() -> f64 {
    25.0
}

fn default_discovery_checkpoint() -> f64 {
    27.0
}

fn default_install_baseline() -> f64 {
    30.0
}

fn default_install_budget() -> f64 {
    10.0
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("/var/log/sphere-updates")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

/// Primary configuration object for the updater daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub fixtures: FixtureConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no candidate existed and built-in defaults were used.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "SPHERE_UPDATES_CONFIG";

    /// Load configuration from disk, respecting the `SPHERE_UPDATES_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit `SPHERE_UPDATES_CONFIG` path must exist. Otherwise the first
    /// existing candidate wins, and the built-in defaults apply when none exist.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        let config = AppConfig::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        self.commands.validate()?;
        self.progress.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            policy: PolicyConfig::default(),
            commands: CommandConfig::default(),
            fixtures: FixtureConfig::default(),
            progress: ProgressConfig::default(),
            job: JobConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// How the updater reaches the package manager.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Drive `apt-get`/`dpkg` and remount the root filesystem.
    System,
    /// Read canned discovery/install output from files; never remount.
    Fixture,
}

impl Mode {
    pub fn is_fixture(&self) -> bool {
        matches!(self, Mode::Fixture)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Mode::System),
            "fixture" => Ok(Mode::Fixture),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Device-specific package selection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Substring an available version must contain to be considered.
    #[serde(default = "default_namespace_marker")]
    pub namespace_marker: String,
    /// Package that is always (re)installed.
    #[serde(default = "default_core_package")]
    pub core_package: String,
    /// Privileged package installed alone before the main batch.
    #[serde(default = "default_override_package")]
    pub override_package: Option<String>,
    /// The updater itself and companion installers.
    #[serde(default = "default_excluded_packages")]
    pub excluded_packages: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            namespace_marker: default_namespace_marker(),
            core_package: default_core_package(),
            override_package: default_override_package(),
            excluded_packages: default_excluded_packages(),
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace_marker.trim().is_empty() {
            return Err(anyhow!("policy.namespace_marker must not be empty"));
        }
        if self.core_package.trim().is_empty() {
            return Err(anyhow!("policy.core_package must not be empty"));
        }
        if self
            .excluded_packages
            .iter()
            .any(|name| name == &self.core_package)
        {
            return Err(anyhow!(
                "policy.core_package '{}' cannot also be excluded",
                self.core_package
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_package_manager")]
    pub package_manager: String,
    #[serde(default = "default_discover_command")]
    pub discover: Vec<String>,
    #[serde(default = "default_repair_command")]
    pub repair: Vec<String>,
    #[serde(default = "default_mount_binary")]
    pub mount: String,
    #[serde(default = "default_root_mount")]
    pub root: PathBuf,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            package_manager: default_package_manager(),
            discover: default_discover_command(),
            repair: default_repair_command(),
            mount: default_mount_binary(),
            root: default_root_mount(),
        }
    }
}

impl CommandConfig {
    pub fn validate(&self) -> Result<()> {
        if self.package_manager.trim().is_empty() {
            return Err(anyhow!("commands.package_manager must not be empty"));
        }
        if self.discover.is_empty() {
            return Err(anyhow!("commands.discover must name a program"));
        }
        if self.repair.is_empty() {
            return Err(anyhow!("commands.repair must name a program"));
        }
        if self.mount.trim().is_empty() {
            return Err(anyhow!("commands.mount must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureConfig {
    #[serde(default = "default_updates_file")]
    pub updates_file: PathBuf,
    #[serde(default = "default_upgrade_file")]
    pub upgrade_file: PathBuf,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            updates_file: default_updates_file(),
            upgrade_file: default_upgrade_file(),
        }
    }
}

/// Calibration constants for the progress estimators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Lines `apt-get update` usually prints on the appliance.
    #[serde(default = "default_cache_expected_lines")]
    pub cache_expected_lines: f64,
    #[serde(default)]
    pub cache_start: f64,
    #[serde(default = "default_cache_budget")]
    pub cache_budget: f64,
    /// Percent reported once discovery begins.
    #[serde(default = "default_discovery_checkpoint")]
    pub discovery_checkpoint: f64,
    #[serde(default = "default_install_baseline")]
    pub install_baseline: f64,
    #[serde(default = "default_install_budget")]
    pub install_budget: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            cache_expected_lines: default_cache_expected_lines(),
            cache_start: 0.0,
            cache_budget: default_cache_budget(),
            discovery_checkpoint: default_discovery_checkpoint(),
            install_baseline: default_install_baseline(),
            install_budget: default_install_budget(),
        }
    }
}

impl ProgressConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.cache_expected_lines > 0.0) {
            return Err(anyhow!("progress.cache_expected_lines must be positive"));
        }
        for (name, value) in [
            ("cache_start", self.cache_start),
            ("cache_budget", self.cache_budget),
            ("discovery_checkpoint", self.discovery_checkpoint),
            ("install_baseline", self.install_baseline),
            ("install_budget", self.install_budget),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(anyhow!(
                    "progress.{} must be within [0, 100], got {}",
                    name,
                    value
                ));
            }
        }
        if self.cache_start + self.cache_budget > 100.0 {
            return Err(anyhow!(
                "progress.cache_start + progress.cache_budget exceeds 100"
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobConfig {
    /// Upper bound on any single external command; unset means wait forever.
    #[serde(default, rename = "command_timeout_secs")]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub command_timeout: Option<Duration>,
    #[serde(default)]
    pub run_on_start: bool,
    #[serde(default, rename = "poll_interval_secs")]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub poll_interval: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
