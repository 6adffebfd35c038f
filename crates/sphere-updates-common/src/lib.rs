//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Shared primitives and utilities for the updater runtime."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
//! Shared primitives for the sphere-updates workspace: configuration loading,
//! tracing setup, and build metadata.

pub mod config;
pub mod logging;
pub mod version;

pub use config::{
    AppConfig, CommandConfig, FixtureConfig, JobConfig, LoadedAppConfig, LoggingConfig,
    MetricsConfig, Mode, PolicyConfig, ProgressConfig, DEFAULT_DISCOVERY_PIPELINE,
};
pub use logging::{init_console, init_tracing, LogFormat};
pub use version::VersionInfo;
