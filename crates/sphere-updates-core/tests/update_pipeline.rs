//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "End-to-end update runs against a scripted package manager."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sphere_updates_common::{AppConfig, Mode};
use sphere_updates_core::{
    forward_until_finished, CommandSpec, JobController, JobSettings, JobStage, ProcessError,
    ProcessHandle, ProcessRunner, RemountCommands, ScriptedReply, ScriptedRunner,
};
use sphere_updates_msg::{
    DisplayCall, Progress, RecordingDisplay, ResultIcon, StatusBus, UpdateEvent,
};

const RW: [&str; 3] = ["mount", "-o", "remount,rw"];
const RO: [&str; 3] = ["mount", "-o", "remount,ro"];
const INSTALL: [&str; 2] = ["apt-get", "install"];

fn system_settings() -> JobSettings {
    let mut config = AppConfig {
        mode: Mode::System,
        ..AppConfig::default()
    };
    config.commands.discover = vec!["discover-updates".into()];
    let mut settings = JobSettings::from_config(&config).expect("settings");
    settings.plan.remount = Some(RemountCommands {
        writable: CommandSpec::new("mount").args(["-o", "remount,rw", "/"]),
        read_only: CommandSpec::new("mount").args(["-o", "remount,ro", "/"]),
    });
    settings
}

fn record(name: &str, current: &str, available: &str) -> String {
    format!("{name}\t{current}\t{available}")
}

struct RunReport {
    events: Vec<UpdateEvent>,
    progress: Progress,
    stage: JobStage,
}

impl RunReport {
    fn snapshots(&self) -> Vec<&Progress> {
        self.events
            .iter()
            .filter_map(|event| match event {
                UpdateEvent::Progress(progress) => Some(progress),
                _ => None,
            })
            .collect()
    }

    fn percents(&self) -> Vec<f64> {
        self.snapshots().iter().map(|p| p.percent).collect()
    }

    fn assert_monotonic(&self) {
        let percents = self.percents();
        assert!(
            percents.windows(2).all(|pair| pair[0] <= pair[1]),
            "percent regressed: {percents:?}"
        );
    }
}

async fn run_once(settings: JobSettings, runner: Arc<dyn ProcessRunner>) -> RunReport {
    let (controller, mut events) = JobController::new(settings, runner);
    assert!(controller.start());
    let bus = StatusBus::new();
    let mut seen = Vec::new();
    let outcome = forward_until_finished(&mut events, &bus, |event| seen.push(event.clone())).await;
    assert!(outcome.is_some(), "run never finished");
    controller.wait().await;
    assert!(!controller.is_running());
    RunReport {
        events: seen,
        progress: controller.progress(),
        stage: controller.stage(),
    }
}

fn install_invocations(runner: &ScriptedRunner) -> Vec<String> {
    runner
        .invocations()
        .into_iter()
        .filter(|command| command.matches_prefix(&INSTALL))
        .map(|command| command.to_string())
        .collect()
}

#[tokio::test]
async fn zero_updates_installs_only_the_core_package() {
    let runner = ScriptedRunner::new();
    let report = run_once(system_settings(), Arc::new(runner.clone())).await;

    assert_eq!(report.progress.percent, 100.0);
    assert_eq!(report.progress.error, None);
    assert!(!report.progress.running);
    assert_eq!(report.stage, JobStage::Finished);
    assert_eq!(
        install_invocations(&runner),
        vec!["apt-get install -yy -q ninjasphere"]
    );

    let order: Vec<String> = runner
        .invocations()
        .into_iter()
        .map(|command| command.to_string())
        .collect();
    assert_eq!(
        order,
        vec![
            "mount -o remount,rw /",
            "dpkg --configure -a",
            "apt-get update -q",
            "discover-updates",
            "apt-get autoremove -y",
            "apt-get install -yy -q ninjasphere",
            "mount -o remount,ro /",
        ]
    );

    assert_eq!(report.events.first(), Some(&UpdateEvent::Started));
    assert_eq!(report.events.last(), Some(&UpdateEvent::Finished { error: None }));
    let snapshots = report.snapshots();
    assert!(snapshots[0].running);
    assert_eq!(snapshots[0].percent, 0.0);
    let terminal = snapshots.last().expect("terminal snapshot");
    assert!(!terminal.running);
    assert_eq!(terminal.percent, 100.0);
    report.assert_monotonic();
}

#[tokio::test]
async fn override_package_is_installed_alone_then_discovery_reruns() {
    let runner = ScriptedRunner::new();
    runner
        .on(
            ["discover-updates"],
            ScriptedReply::lines([
                record("sphere-ui", "1.0~spheramid", "1.1~spheramid"),
                record("sphere-idspispopd", "1~spheramid", "2~spheramid"),
            ]),
        )
        .on(
            ["discover-updates"],
            ScriptedReply::lines([
                record("sphere-ui", "1.0~spheramid", "1.2~spheramid"),
                record("sphere-idspispopd", "2~spheramid", "3~spheramid"),
            ]),
        );
    let report = run_once(system_settings(), Arc::new(runner.clone())).await;

    assert_eq!(report.progress.error, None);
    assert_eq!(runner.count_matching(&["discover-updates"]), 2);
    assert_eq!(
        install_invocations(&runner),
        vec![
            "apt-get install -yy -q sphere-idspispopd",
            "apt-get install -yy -q sphere-ui ninjasphere",
        ]
    );
    assert!(report
        .snapshots()
        .iter()
        .any(|p| p.description == "Running pre-install script"));
    report.assert_monotonic();
}

#[tokio::test]
async fn updater_and_foreign_packages_never_reach_install() {
    let runner = ScriptedRunner::new();
    runner.on(
        ["discover-updates"],
        ScriptedReply::lines([
            record("sphere-updates", "0.9~spheramid", "1.0~spheramid"),
            record("libc6", "2.19", "2.19-1"),
            record("ninjasphere", "1.0~spheramid", "1.1~spheramid"),
            "garbage line".to_string(),
        ]),
    );
    let report = run_once(system_settings(), Arc::new(runner.clone())).await;

    assert_eq!(report.progress.error, None);
    assert_eq!(
        install_invocations(&runner),
        vec!["apt-get install -yy -q ninjasphere"]
    );
}

#[tokio::test]
async fn install_summary_recalibrates_package_share() {
    let runner = ScriptedRunner::new();
    runner.on(
        INSTALL,
        ScriptedReply::lines([
            "Reading package lists...",
            "3 upgraded, 1 newly installed, 0 to remove and 0 not upgraded.",
            "Get:1 http://repo stable/main sphere-ui 1.1~spheramid [10 kB]",
            "Setting up sphere-ui (1.1~spheramid) ...",
        ]),
    );
    let report = run_once(system_settings(), Arc::new(runner)).await;

    let percents = report.percents();
    for expected in [27.0, 30.0, 35.0, 40.0, 42.5, 100.0] {
        assert!(percents.contains(&expected), "{expected} missing from {percents:?}");
    }
    report.assert_monotonic();
}

#[tokio::test]
async fn cache_refresh_is_capped_at_its_budget() {
    let runner = ScriptedRunner::new();
    let lines: Vec<String> = (0..90)
        .map(|idx| format!("Hit:{idx} http://repo stable InRelease"))
        .collect();
    runner.on(["apt-get", "update"], ScriptedReply::lines(lines));
    let report = run_once(system_settings(), Arc::new(runner)).await;

    let refresh_peak = report
        .snapshots()
        .iter()
        .filter(|p| p.description == "Looking for updates")
        .map(|p| p.percent)
        .fold(0.0_f64, f64::max);
    assert_eq!(refresh_peak, 25.0);
    report.assert_monotonic();
}

#[tokio::test]
async fn install_exit_code_fails_the_run_and_restores_read_only() {
    let runner = ScriptedRunner::new();
    runner.on(
        INSTALL,
        ScriptedReply::exit_code(100).with_lines(["Reading package lists..."]),
    );
    let report = run_once(system_settings(), Arc::new(runner.clone())).await;

    let error = report.progress.error.clone().expect("error recorded");
    assert!(error.contains("100"), "{error}");
    assert!(!report.progress.running);
    assert!(report.progress.percent < 100.0);
    assert_eq!(report.progress.percent, 35.0);
    assert_eq!(report.progress.description, "Failed");
    assert_eq!(report.stage, JobStage::Failed);
    assert_eq!(
        report.events.last(),
        Some(&UpdateEvent::Finished { error: Some(error) })
    );
    assert_eq!(runner.count_matching(&RW), 1);
    assert_eq!(runner.count_matching(&RO), 1);
    report.assert_monotonic();
}

#[tokio::test]
async fn failed_remount_stops_before_any_mutation() {
    let runner = ScriptedRunner::new();
    runner.on(RW, ScriptedReply::exit_code(32));
    let report = run_once(system_settings(), Arc::new(runner.clone())).await;

    assert_eq!(report.progress.description, "Failed to enable disk writing");
    assert!(report.progress.error.is_some());
    assert_eq!(runner.count_matching(&["dpkg"]), 0);
    assert_eq!(runner.count_matching(&["apt-get"]), 0);
    assert_eq!(runner.count_matching(&RO), 0);
}

#[tokio::test]
async fn failed_override_install_reports_pre_install_failure() {
    let runner = ScriptedRunner::new();
    runner
        .on(
            ["discover-updates"],
            ScriptedReply::lines([record("sphere-idspispopd", "1~spheramid", "2~spheramid")]),
        )
        .on(
            ["apt-get", "install", "-yy", "-q", "sphere-idspispopd"],
            ScriptedReply::exit_code(1),
        );
    let report = run_once(system_settings(), Arc::new(runner.clone())).await;

    assert_eq!(report.progress.description, "Failed running pre-install script");
    assert_eq!(runner.count_matching(&["discover-updates"]), 1);
    assert_eq!(runner.count_matching(&RO), 1);
}

#[tokio::test]
async fn best_effort_stages_do_not_fail_the_run() {
    let runner = ScriptedRunner::new();
    runner
        .on(["dpkg"], ScriptedReply::exit_code(1))
        .on(["apt-get", "autoremove"], ScriptedReply::spawn_failure());
    let report = run_once(system_settings(), Arc::new(runner)).await;

    assert_eq!(report.progress.error, None);
    assert_eq!(report.progress.percent, 100.0);
}

#[tokio::test]
async fn discovery_failure_ends_the_run() {
    let runner = ScriptedRunner::new();
    runner.on(["discover-updates"], ScriptedReply::exit_code(2));
    let report = run_once(system_settings(), Arc::new(runner.clone())).await;

    let error = report.progress.error.expect("error");
    assert!(error.starts_with("Failed to get updatable packages"), "{error}");
    assert_eq!(report.progress.percent, 27.0);
    assert_eq!(runner.count_matching(&INSTALL), 0);
    assert_eq!(runner.count_matching(&RO), 1);
}

#[tokio::test]
async fn hung_install_times_out() {
    let runner = ScriptedRunner::new();
    runner.on(INSTALL, ScriptedReply::hang().with_lines(["Reading package lists..."]));
    let settings = JobSettings {
        command_timeout: Some(Duration::from_millis(100)),
        ..system_settings()
    };
    let report = run_once(settings, Arc::new(runner.clone())).await;

    let error = report.progress.error.expect("timeout error");
    assert!(error.contains("did not finish"), "{error}");
    assert_eq!(runner.count_matching(&RO), 1);
}

#[tokio::test]
async fn slow_event_consumer_does_not_count_towards_command_timeout() {
    let runner = ScriptedRunner::new();
    runner.on(
        INSTALL,
        ScriptedReply::lines([
            "3 upgraded, 1 newly installed, 0 to remove and 0 not upgraded.",
            "Get:1 http://repo stable/main sphere-ui 1.1~spheramid [10 kB]",
            "Setting up sphere-ui (1.1~spheramid) ...",
            "Get:2 http://repo stable/main sphere-go 2.0~spheramid [80 kB]",
            "Setting up sphere-go (2.0~spheramid) ...",
        ]),
    );
    let settings = JobSettings {
        command_timeout: Some(Duration::from_millis(200)),
        ..system_settings()
    };
    let (controller, mut events) = JobController::new(settings, Arc::new(runner.clone()));
    assert!(controller.start());

    let mut finished = None;
    while let Some(event) = events.recv().await {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let UpdateEvent::Finished { error } = event {
            finished = Some(error);
            break;
        }
    }
    controller.wait().await;

    assert_eq!(finished, Some(None));
    assert_eq!(controller.progress().percent, 100.0);
    assert_eq!(controller.stage(), JobStage::Finished);
}

/// Delegates to a [`ScriptedRunner`] but panics on the install command.
struct PanicOnInstall(ScriptedRunner);

#[async_trait]
impl ProcessRunner for PanicOnInstall {
    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        if command.matches_prefix(&INSTALL) {
            panic!("package manager crashed");
        }
        self.0.spawn(command).await
    }
}

#[tokio::test]
async fn panicking_stage_restores_read_only_before_the_terminal_event() {
    let runner = ScriptedRunner::new();
    let (controller, mut events) =
        JobController::new(system_settings(), Arc::new(PanicOnInstall(runner.clone())));
    assert!(controller.start());

    let mut at_finish = None;
    while let Some(event) = events.recv().await {
        if let UpdateEvent::Finished { error } = event {
            at_finish = Some((runner.count_matching(&RO), error));
            break;
        }
    }
    controller.wait().await;

    let (read_only_remounts, error) = at_finish.expect("terminal event");
    assert_eq!(read_only_remounts, 1);
    let error = error.expect("aborted run reports an error");
    assert!(error.contains("Update worker aborted"), "{error}");
    assert_eq!(runner.count_matching(&RO), 1);
    assert_eq!(controller.stage(), JobStage::Failed);
    assert!(!controller.is_running());
}

#[tokio::test]
async fn controller_accepts_a_new_run_after_failure() {
    let runner = ScriptedRunner::new();
    runner
        .on(INSTALL, ScriptedReply::exit_code(100))
        .on(INSTALL, ScriptedReply::success());
    let (controller, mut events) = JobController::new(system_settings(), Arc::new(runner.clone()));
    let bus = StatusBus::new();

    assert!(controller.start());
    let first = forward_until_finished(&mut events, &bus, |_| {}).await;
    controller.wait().await;
    assert!(matches!(first, Some(Err(_))));

    assert!(controller.start());
    let fresh = controller.progress();
    assert!(fresh.running);
    assert_eq!(fresh.percent, 0.0);
    assert_eq!(fresh.error, None);

    let second = forward_until_finished(&mut events, &bus, |_| {}).await;
    controller.wait().await;
    assert_eq!(second, Some(Ok(())));
    assert_eq!(runner.count_matching(&RO), 2);
}

#[tokio::test]
async fn display_follows_progress_and_shows_result() {
    let runner = ScriptedRunner::new();
    let (controller, mut events) = JobController::new(system_settings(), Arc::new(runner));
    let mut bus = StatusBus::new();
    let display = Arc::new(RecordingDisplay::new());
    bus.attach_display(display.clone());

    assert!(controller.start());
    forward_until_finished(&mut events, &bus, |_| {}).await;
    controller.wait().await;

    let calls = display.calls();
    assert_eq!(calls.first(), Some(&DisplayCall::Progress(0.0)));
    assert_eq!(calls.last(), Some(&DisplayCall::Result(ResultIcon::Succeeded)));
    let results = calls
        .iter()
        .filter(|call| matches!(call, DisplayCall::Result(_)))
        .count();
    assert_eq!(results, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn fixture_mode_replays_recorded_output() {
    use std::io::Write;

    use sphere_updates_core::TokioProcessRunner;

    let dir = tempfile::tempdir().expect("tempdir");
    let updates = dir.path().join("updates.txt");
    let upgrade = dir.path().join("upgrade.txt");
    let mut file = std::fs::File::create(&updates).expect("updates");
    writeln!(file, "{}", record("sphere-ui", "1.0~spheramid", "1.1~spheramid")).expect("write");
    let mut file = std::fs::File::create(&upgrade).expect("upgrade");
    writeln!(file, "Reading package lists...\nSetting up sphere-ui (1.1~spheramid) ...").expect("write");

    let mut config = AppConfig {
        mode: Mode::Fixture,
        ..AppConfig::default()
    };
    config.fixtures.updates_file = updates;
    config.fixtures.upgrade_file = upgrade;
    let settings = JobSettings::from_config(&config).expect("settings");

    let report = run_once(settings, Arc::new(TokioProcessRunner)).await;
    assert_eq!(report.progress.error, None);
    assert_eq!(report.progress.percent, 100.0);
    assert!(report.percents().contains(&35.0));
    report.assert_monotonic();
}
