//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "binary"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Binary entrypoint for the sphere-updates daemon."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use sphere_updates_common::{init_console, init_tracing, AppConfig, Mode, VersionInfo};
use sphere_updates_core::{
    discover_install_set, forward_until_finished, JobController, JobSettings, ProcessRunner,
    TokioProcessRunner,
};
use sphere_updates_msg::{LogDisplay, StatusBus, UpdateEvent};
use tracing::{info, warn};

mod daemon;

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Unattended package update daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[arg(long, value_enum, help = "Override update mode")]
    mode: Option<CliMode>,

    #[arg(long, help = "Start an update as soon as the daemon is up")]
    run_on_start: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    System,
    Fixture,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::System => Mode::System,
            CliMode::Fixture => Mode::Fixture,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Host the update controller until terminated")]
    Run,
    #[command(about = "Run a single update in the foreground")]
    Once,
    #[command(about = "Print the packages an update would install, without installing")]
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let version = VersionInfo::current();
    if cli.version {
        println!("{}", version.extended());
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("/etc/sphere-updates/config.toml"));
    candidates.push(PathBuf::from("configs/sphere-updates.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }
    if cli.run_on_start {
        config.job.run_on_start = true;
    }

    let command = cli.command.unwrap_or(Commands::Run);
    match command {
        Commands::Run => init_tracing("sphere-updatesd", &config.logging)?,
        Commands::Once | Commands::Check => init_console(config.logging.format),
    }
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), mode = ?config.mode, "configuration loaded"),
        None => info!(mode = ?config.mode, "no configuration file found; using defaults"),
    }

    let settings = JobSettings::from_config(&config)?;
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);

    match command {
        Commands::Run => daemon::run(config, settings, runner, version).await,
        Commands::Once => run_once(settings, runner).await,
        Commands::Check => check(settings, runner).await,
    }
}

async fn run_once(settings: JobSettings, runner: Arc<dyn ProcessRunner>) -> Result<()> {
    let (controller, mut events) = JobController::new(settings, runner);
    let mut bus = StatusBus::new();
    bus.attach_display(Arc::new(LogDisplay));

    if !controller.start() {
        bail!("update controller refused to start");
    }

    let forward = forward_until_finished(&mut events, &bus, |event| {
        if let UpdateEvent::Progress(progress) = event {
            println!("{:>5.1}% {}", progress.percent, progress.description);
        }
    });
    tokio::pin!(forward);
    let mut cancelled = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut forward => break outcome,
            signal = daemon::shutdown_signal(), if !cancelled => {
                let reason = signal?;
                warn!(signal = reason, "cancelling update");
                controller.cancel();
                cancelled = true;
            }
        }
    };
    controller.wait().await;

    match outcome {
        Some(Ok(())) => {
            println!("update finished");
            Ok(())
        }
        Some(Err(error)) => bail!("update failed: {error}"),
        None => bail!("update channel closed before the run finished"),
    }
}

async fn check(settings: JobSettings, runner: Arc<dyn ProcessRunner>) -> Result<()> {
    let updates = discover_install_set(runner.as_ref(), &settings)
        .await
        .context("failed to discover available updates")?;
    println!("{}", serde_json::to_string_pretty(&updates)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_to_run_without_subcommand() {
        let cli = Cli::parse_from(["sphere-updatesd", "--mode", "fixture"]);
        assert!(cli.command.is_none());
        assert!(matches!(cli.mode, Some(CliMode::Fixture)));
        let cli = Cli::parse_from(["sphere-updatesd", "--config", "x.toml", "check"]);
        assert!(matches!(cli.command, Some(Commands::Check)));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }
}
