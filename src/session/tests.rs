//! Unit tests for session setup, environment bindings and teardown.

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::bridge::{CommandOutput, DebugBridge};
use crate::broker::Interrupt;
use crate::farm::{FarmError, ReservationFailure};
use crate::filter::JobVariables;
use crate::test_support::{ScriptedFarm, ScriptedRunner, scripted_device};

struct Harness {
    farm: ScriptedFarm,
    runner: ScriptedRunner,
    interrupt: Interrupt,
    root: TempDir,
    options: SessionOptions,
}

impl Harness {
    fn path(&self, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.root.path().join(name)).expect("utf-8 temp path")
    }

    fn session(&self) -> ReservationSession<ScriptedFarm, ScriptedRunner> {
        let broker = ConnectionBroker::new(
            DebugBridge::new(self.runner.clone(), "adb", 5037),
            self.interrupt.clone(),
        );
        ReservationSession::new(
            self.farm.clone(),
            FarmSettings::new("https://stf.example.com/api/v1", "token", false)
                .expect("settings"),
            broker,
            self.options.clone(),
        )
    }

    fn with_farm(mut self, farm: ScriptedFarm) -> Self {
        self.farm = farm;
        self
    }

    fn calls(&self, subcommand: &str) -> usize {
        self.runner.commands_for(subcommand).len()
    }
}

#[fixture]
fn harness() -> Harness {
    let root = TempDir::new().expect("temp root");
    let base = Utf8PathBuf::from_path_buf(root.path().to_path_buf()).expect("utf-8 temp path");
    let options = SessionOptions {
        policy: ReservationPolicy::default(),
        connect_timeout: Duration::from_millis(5_000),
        settle_delay: Duration::from_secs(5),
        workspace: base.join("workspace"),
        artifact_dir: base.join("artifacts"),
        adb_keys: None,
        adb_key_dir: base.join("keys").to_string(),
    };
    Harness {
        farm: ScriptedFarm::new(),
        runner: ScriptedRunner::new(),
        interrupt: Interrupt::new(),
        root,
        options,
    }
}

fn filter() -> FilterSpec {
    FilterSpec::validate(
        &[(String::from("sdk"), String::from("7.0"))],
        &JobVariables::new(),
    )
    .expect("filter")
}

fn one_device() -> Vec<ReservedDevice> {
    vec![scripted_device("HT1", "10.0.0.1:7401")]
}

fn three_devices() -> Vec<ReservedDevice> {
    vec![
        scripted_device("HT1", "10.0.0.1:7401"),
        scripted_device("HT2", "10.0.0.2:7402"),
        scripted_device("HT3", "10.0.0.3:7403"),
    ]
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn no_matching_device_leaves_no_side_effects(harness: Harness) {
    let err = harness
        .session()
        .setup(&filter())
        .await
        .expect_err("no device matches");

    assert_eq!(err, SetupError::Reservation(FarmError::NoMatchingDevice));
    assert_eq!(err.verdict(), JobVerdict::NotBuilt);
    assert_eq!(harness.farm.calls(), vec!["verify", "reserve"]);
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rejected_farm_check_stops_before_reserving(harness: Harness) {
    let farm = ScriptedFarm::new().with_verify_failure(FarmError::RemoteApi {
        message: String::from("401"),
    });
    let harness = harness.with_farm(farm);

    let err = harness
        .session()
        .setup(&filter())
        .await
        .expect_err("verify fails");

    assert!(matches!(err, SetupError::Verification(_)));
    assert_eq!(err.verdict(), JobVerdict::NotBuilt);
    assert_eq!(harness.farm.calls(), vec!["verify"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn connection_timeout_disconnects_and_releases(harness: Harness) {
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(one_device()));
    harness.runner.push_listing(&["10.0.0.1:7401\toffline"]);
    harness.runner.push_log_stream("boot log\n", false);

    let err = harness
        .session()
        .setup(&filter())
        .await
        .expect_err("device never ready");

    assert!(matches!(err, SetupError::ConnectionTimeout { timeout_ms: 5_000, .. }));
    assert_eq!(err.verdict(), JobVerdict::Failed);
    assert_eq!(harness.farm.released(), vec!["HT1"]);
    assert_eq!(
        harness.runner.commands_for("disconnect"),
        vec!["adb -P 5037 disconnect 10.0.0.1:7401"]
    );
    assert_eq!(harness.calls("kill-server"), 1);
    assert!(harness.path("artifacts").exists());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn successful_setup_exposes_environment(harness: Harness) {
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(one_device()));
    harness.runner.push_listing(&["10.0.0.1:7401\tdevice"]);
    harness.runner.push_log_stream("hello\n", true);

    let started = tokio::time::Instant::now();
    let mut session = harness.session().setup(&filter()).await.expect("setup");

    assert!(started.elapsed() >= Duration::from_secs(5), "settle delay applies");
    assert_eq!(harness.calls("start-server"), 2);
    let env = session.environment();
    assert_eq!(env.get(ENV_SERIAL).map(String::as_str), Some("10.0.0.1:7401"));
    assert_eq!(env.get(ENV_AVD_DEVICE).map(String::as_str), Some("10.0.0.1:7401"));
    assert_eq!(env.get(ENV_ADB_PORT).map(String::as_str), Some("5037"));
    let log = env.get(ENV_LOGCAT_FILE).expect("log file binding");
    assert!(log.contains("logcat_HT1_"), "log: {log}");

    let report = session.teardown().await;
    assert!(report.is_clean(), "faults: {:?}", report.faults);
    assert_eq!(report.released, vec!["HT1"]);
    assert_eq!(report.archived.len(), 1);
    assert!(!Utf8PathBuf::from(log.as_str()).exists());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn teardown_runs_once(harness: Harness) {
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(one_device()));
    harness.runner.push_listing(&["10.0.0.1:7401\tdevice"]);
    harness.runner.push_log_stream("", false);
    let mut session = harness.session().setup(&filter()).await.expect("setup");

    let first = session.teardown().await;
    let second = session.teardown().await;

    assert_eq!(first.released, vec!["HT1"]);
    assert_eq!(second, TeardownReport::default());
    assert_eq!(harness.farm.released(), vec!["HT1"]);
    assert_eq!(harness.calls("kill-server"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn partial_reservation_is_released(harness: Harness) {
    let reserved = vec![
        scripted_device("HT1", "10.0.0.1:7401"),
        scripted_device("HT2", "10.0.0.2:7402"),
    ];
    let farm = ScriptedFarm::new().with_reservation_failure(ReservationFailure {
        error: FarmError::RemoteApi {
            message: String::from("503"),
        },
        reserved,
    });
    let harness = harness.with_farm(farm);

    let err = harness
        .session()
        .setup(&filter())
        .await
        .expect_err("reservation fails part-way");

    assert_eq!(err.verdict(), JobVerdict::NotBuilt);
    assert_eq!(harness.farm.released(), vec!["HT1", "HT2"]);
    assert_eq!(harness.calls("logcat"), 0);
    assert_eq!(harness.calls("kill-server"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_capture_does_not_stop_release_or_other_archives(harness: Harness) {
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(three_devices()));
    harness.runner.push_listing(&["10.0.0.1:7401\tdevice"]);
    harness.runner.push_log_stream("first\n", false);
    harness.runner.push_log_stream("second\n", false);

    let mut session = harness.session().setup(&filter()).await.expect("setup");
    let unavailable: Vec<&str> = session
        .slots()
        .values()
        .filter(|slot| !slot.capture.is_available())
        .map(|slot| slot.device.serial.as_str())
        .collect();
    assert_eq!(unavailable, vec!["HT3"]);
    assert_eq!(session.slots().len(), 3);

    let report = session.teardown().await;
    assert_eq!(report.released, vec!["HT1", "HT2", "HT3"]);
    assert_eq!(report.archived.len(), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn release_failure_is_collected_and_teardown_continues(harness: Harness) {
    let farm = ScriptedFarm::new()
        .with_devices(three_devices())
        .failing_release("HT1");
    let harness = harness.with_farm(farm);
    harness.runner.push_listing(&["10.0.0.2:7402\tdevice"]);
    for payload in ["a\n", "b\n", "c\n"] {
        harness.runner.push_log_stream(payload, false);
    }

    let mut session = harness.session().setup(&filter()).await.expect("setup");
    let report = session.teardown().await;

    assert_eq!(harness.farm.released(), vec!["HT1", "HT2", "HT3"]);
    assert_eq!(report.released, vec!["HT2", "HT3"]);
    assert!(matches!(
        report.faults.as_slice(),
        [TeardownFault::Release { serial, .. }] if serial == "HT1"
    ));
    assert_eq!(report.archived.len(), 3);
    assert_eq!(harness.calls("kill-server"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn teardown_disconnects_before_stopping_the_server(harness: Harness) {
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(one_device()));
    harness.runner.push_listing(&["10.0.0.1:7401\tdevice"]);
    harness.runner.push_log_stream("", false);
    harness.runner.push_for(
        "disconnect",
        CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: String::from("error: no such device"),
        },
    );
    let mut session = harness.session().setup(&filter()).await.expect("setup");

    let report = session.teardown().await;

    let order: Vec<String> = harness
        .runner
        .invocations()
        .iter()
        .filter_map(crate::test_support::CommandInvocation::subcommand)
        .filter(|sub| sub == "disconnect" || sub == "kill-server")
        .collect();
    assert_eq!(order, vec!["disconnect", "kill-server"]);
    assert!(matches!(
        report.faults.as_slice(),
        [TeardownFault::Disconnect { .. }]
    ));
    assert_eq!(report.released, vec!["HT1"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn interrupt_during_wait_tears_down(harness: Harness) {
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(one_device()));
    harness.runner.push_listing(&[]);
    harness.runner.push_log_stream("", false);
    let trigger = harness.interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.raise();
    });

    let err = harness
        .session()
        .setup(&filter())
        .await
        .expect_err("interrupted");

    assert_eq!(err, SetupError::Interrupted);
    assert_eq!(err.verdict(), JobVerdict::Aborted);
    assert_eq!(harness.calls("connect"), 1);
    assert_eq!(harness.farm.released(), vec!["HT1"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn interrupt_before_setup_reserves_nothing(harness: Harness) {
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(one_device()));
    harness.runner.push_log_stream("", false);
    harness.interrupt.raise();

    let err = harness
        .session()
        .setup(&filter())
        .await
        .expect_err("interrupted");

    assert_eq!(err, SetupError::Interrupted);
    assert_eq!(harness.farm.calls(), vec!["verify"]);
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn interrupted_farm_wait_is_reported_as_interrupt(harness: Harness) {
    let farm = ScriptedFarm::new().with_reservation_failure(ReservationFailure {
        error: FarmError::Interrupted,
        reserved: Vec::new(),
    });
    let harness = harness.with_farm(farm);

    let err = harness
        .session()
        .setup(&filter())
        .await
        .expect_err("interrupted");

    assert_eq!(err, SetupError::Interrupted);
    assert!(harness.farm.released().is_empty());
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unusable_workspace_fails_after_teardown(mut harness: Harness) {
    let blocker = harness.path("blocker");
    std::fs::write(&blocker, "not a directory").expect("write blocker");
    harness.options.workspace = blocker.join("workspace");
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(one_device()));

    let err = harness
        .session()
        .setup(&filter())
        .await
        .expect_err("workspace unusable");

    assert!(matches!(err, SetupError::Workspace { .. }));
    assert_eq!(err.verdict(), JobVerdict::Failed);
    assert_eq!(harness.farm.released(), vec!["HT1"]);
    assert_eq!(harness.calls("connect"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn adb_keys_are_installed_before_the_server_starts(mut harness: Harness) {
    harness.options.adb_keys = Some(AdbKeyPair::new("PUBLIC", "PRIVATE"));
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(one_device()));
    harness.runner.push_listing(&["10.0.0.1:7401\tdevice"]);
    harness.runner.push_log_stream("", false);

    let mut session = harness.session().setup(&filter()).await.expect("setup");
    session.teardown().await;

    let keys = harness.path("keys");
    assert_eq!(
        std::fs::read_to_string(keys.join("adbkey")).expect("private key"),
        "PRIVATE"
    );
    assert_eq!(
        std::fs::read_to_string(keys.join("adbkey.pub")).expect("public key"),
        "PUBLIC"
    );
}

#[cfg(unix)]
#[rstest]
#[case::fresh(false)]
#[case::overwritten(true)]
fn private_adb_key_is_owner_only(harness: Harness, #[case] preexisting: bool) {
    use std::os::unix::fs::PermissionsExt;

    let keys = harness.path("keys");
    if preexisting {
        std::fs::create_dir_all(&keys).expect("key dir");
        std::fs::write(keys.join("adbkey"), "OLD").expect("old private key");
        std::fs::set_permissions(keys.join("adbkey"), std::fs::Permissions::from_mode(0o644))
            .expect("loosen mode");
    }

    AdbKeyPair::new("PUBLIC", "PRIVATE")
        .install(keys.as_str())
        .expect("install");

    let mode = |name: &str| {
        std::fs::metadata(keys.join(name))
            .expect("key metadata")
            .permissions()
            .mode()
            & 0o777
    };
    assert_eq!(mode("adbkey"), 0o600);
    assert_eq!(mode("adbkey.pub"), 0o644);
    assert_eq!(
        std::fs::read_to_string(keys.join("adbkey")).expect("private key"),
        "PRIVATE"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn adb_key_failure_is_not_built_and_releases(mut harness: Harness) {
    let blocker = harness.path("keys-file");
    std::fs::write(&blocker, "occupied").expect("write blocker");
    harness.options.adb_keys = Some(AdbKeyPair::new("PUBLIC", "PRIVATE"));
    harness.options.adb_key_dir = blocker.join("nested").to_string();
    let harness = harness.with_farm(ScriptedFarm::new().with_devices(one_device()));

    let err = harness
        .session()
        .setup(&filter())
        .await
        .expect_err("key install fails");

    assert!(matches!(err, SetupError::AdbKey(_)));
    assert_eq!(err.verdict(), JobVerdict::NotBuilt);
    assert_eq!(harness.farm.released(), vec!["HT1"]);
    assert_eq!(harness.calls("start-server"), 0);
}

#[rstest]
#[case(JobVerdict::NotBuilt, 3)]
#[case(JobVerdict::Failed, 1)]
#[case(JobVerdict::Aborted, 130)]
fn verdicts_map_to_exit_codes(#[case] verdict: JobVerdict, #[case] code: i32) {
    assert_eq!(verdict.exit_code(), code);
}

#[rstest]
#[case(Some("PUB"), Some("PRIV"), true)]
#[case(Some("PUB"), None, false)]
#[case(Some("  "), Some("PRIV"), false)]
#[case(None, None, false)]
fn options_pick_up_complete_key_pairs(
    #[case] public: Option<&str>,
    #[case] private: Option<&str>,
    #[case] expected: bool,
) {
    let config = SessionConfig {
        adb_bin: String::from("adb"),
        adb_server_port: 5037,
        connect_timeout_ms: 30_000,
        settle_delay_ms: 5_000,
        release_wait_minutes: 2,
        reserve_all_matching: true,
        workspace_dir: String::from("."),
        artifact_dir: String::from("artifacts"),
        adb_public_key: public.map(str::to_owned),
        adb_private_key: private.map(str::to_owned),
        adb_key_dir: String::from("~/.android"),
    };
    let options = SessionOptions::from_config(&config);
    assert_eq!(options.adb_keys.is_some(), expected);
    assert_eq!(options.policy.wait, Duration::from_secs(120));
    assert!(options.policy.all_matching);
    assert_eq!(options.connect_timeout, Duration::from_secs(30));
}

#[rstest]
fn tilde_expands_against_home() {
    let Some(home) = std::env::var_os("HOME") else {
        return;
    };
    let expanded = adb_key::expand_tilde("~/.android");
    assert_eq!(expanded, format!("{}/.android", home.to_string_lossy()));
    assert_eq!(adb_key::expand_tilde("/opt/keys"), "/opt/keys");
}
