//! ---
//! sphere_section: "04-configuration-orchestration"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Checks that the configuration files shipped in configs/ load."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use sphere_updates_common::{AppConfig, LogFormat, Mode, DEFAULT_DISCOVERY_PIPELINE};

fn config_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../configs")
        .join(name)
}

#[test]
fn device_config_matches_builtin_defaults() {
    let config = AppConfig::load(&[config_path("sphere-updates.toml")]).expect("load");
    let defaults = AppConfig::default();
    assert_eq!(config.mode, Mode::System);
    assert_eq!(config.commands.discover[2], DEFAULT_DISCOVERY_PIPELINE);
    assert_eq!(config.commands.repair, defaults.commands.repair);
    assert_eq!(config.policy.core_package, defaults.policy.core_package);
    assert_eq!(config.progress.cache_expected_lines, 45.0);
    assert_eq!(config.job.command_timeout, Some(Duration::from_secs(3600)));
    assert_eq!(config.job.poll_interval, Some(Duration::from_secs(86_400)));
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
}

#[test]
fn fixture_config_points_at_demo_data() {
    let config = AppConfig::load(&[config_path("sphere-updates.fixture.toml")]).expect("load");
    assert!(config.mode.is_fixture());
    assert!(config.fixtures.updates_file.ends_with("updates.txt"));
    assert_eq!(config.logging.format, LogFormat::Pretty);
}
