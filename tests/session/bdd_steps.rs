//! BDD step definitions for the reservation session lifecycle.

use std::collections::BTreeMap;

use rstest_bdd_macros::{given, then, when};
use stf_lease::test_support::{ScriptedFarm, scripted_device};
use stf_lease::{FarmError, FilterSpec, JobVariables, ReservationFailure};
use tokio::runtime::Runtime;

use super::test_helpers::{SessionContext, SessionOutcome};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a farm offering device \"{serial}\" at \"{url}\"")]
fn farm_offering_device(
    mut session_context: SessionContext,
    serial: String,
    url: String,
) -> SessionContext {
    session_context.farm = ScriptedFarm::new().with_devices(vec![scripted_device(&serial, &url)]);
    session_context
        .runner
        .push_log_stream("01-01 00:00:00.000 I/Boot( 1): ready\n", false);
    session_context
}

#[given("a farm with no matching devices")]
fn farm_without_devices(session_context: SessionContext) -> SessionContext {
    session_context
}

#[given("a farm that claims device \"{claimed}\" before refusing \"{refused}\"")]
fn farm_refusing_second_device(
    mut session_context: SessionContext,
    claimed: String,
    refused: String,
) -> SessionContext {
    let failure = ReservationFailure {
        error: FarmError::Rejected {
            action: String::from("reserve"),
            serial: refused,
            message: String::from("device already owned"),
        },
        reserved: vec![scripted_device(&claimed, "10.0.0.1:7401")],
    };
    session_context.farm = ScriptedFarm::new().with_reservation_failure(failure);
    session_context
}

#[given("the bridge lists \"{url}\" as \"{status}\"")]
fn bridge_lists(session_context: SessionContext, url: String, status: String) -> SessionContext {
    let line = format!("{url}\t{status}");
    session_context.runner.push_listing(&[line.as_str()]);
    session_context
}

#[when("I lease a device matching \"{filter}\"")]
fn lease_device(
    session_context: SessionContext,
    filter: String,
) -> Result<SessionContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let spec = FilterSpec::from_args(&[filter], &JobVariables::new())
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let session = session_context.session();

    let outcome = runtime.block_on(async move {
        match session.setup(&spec).await {
            Ok(mut ready) => {
                let environment = ready.environment();
                let report = ready.teardown().await;
                SessionOutcome::Ready {
                    environment,
                    clean: report.is_clean(),
                }
            }
            Err(err) => SessionOutcome::Failed {
                exit_code: err.verdict().exit_code(),
                message: err.to_string(),
            },
        }
    });

    Ok(SessionContext {
        outcome: Some(outcome),
        ..session_context
    })
}

fn environment(session_context: &SessionContext) -> Result<&BTreeMap<String, String>, StepError> {
    match &session_context.outcome {
        Some(SessionOutcome::Ready { environment, .. }) => Ok(environment),
        other => Err(StepError::Assertion(format!(
            "expected a ready session, got {other:?}"
        ))),
    }
}

#[then("the job environment names the device \"{url}\"")]
fn environment_names_device(
    session_context: &SessionContext,
    url: String,
) -> Result<(), StepError> {
    let environment = environment(session_context)?;
    for key in ["ANDROID_SERIAL", "ANDROID_AVD_DEVICE"] {
        if environment.get(key) != Some(&url) {
            return Err(StepError::Assertion(format!(
                "expected {key}={url}, got {environment:?}"
            )));
        }
    }
    if environment.get("ANDROID_ADB_SERVER_PORT").map(String::as_str) != Some("5037") {
        return Err(StepError::Assertion(format!(
            "expected the bridge port, got {environment:?}"
        )));
    }
    Ok(())
}

#[then("the job environment carries a live log file")]
fn environment_has_log_file(session_context: &SessionContext) -> Result<(), StepError> {
    let environment = environment(session_context)?;
    match environment.get("ANDROID_TMP_LOGCAT_FILE") {
        Some(path) if path.starts_with(session_context.root.join("workspace").as_str()) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a log file under the workspace, got {other:?}"
        ))),
    }
}

#[then("setup fails with exit code \"{code}\"")]
fn setup_fails(session_context: &SessionContext, code: i32) -> Result<(), StepError> {
    match &session_context.outcome {
        Some(SessionOutcome::Failed { exit_code, .. }) if *exit_code == code => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected setup failure with exit code {code}, got {other:?}"
        ))),
    }
}

#[then("device \"{serial}\" is released")]
fn device_released(session_context: &SessionContext, serial: String) -> Result<(), StepError> {
    if session_context.farm.released().contains(&serial) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {serial} to be released, farm calls: {:?}",
            session_context.farm.calls()
        )))
    }
}

#[then("the bridge server is stopped")]
fn bridge_server_stopped(session_context: &SessionContext) -> Result<(), StepError> {
    if session_context.runner.commands_for("kill-server").is_empty() {
        Err(StepError::Assertion(String::from(
            "expected adb kill-server during teardown",
        )))
    } else {
        Ok(())
    }
}

#[then("no bridge command was issued")]
fn no_bridge_command(session_context: &SessionContext) -> Result<(), StepError> {
    let invocations = session_context.runner.invocations();
    if invocations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no bridge commands, got {invocations:?}"
        )))
    }
}

#[then("teardown reports no faults")]
fn teardown_clean(session_context: &SessionContext) -> Result<(), StepError> {
    match &session_context.outcome {
        Some(SessionOutcome::Ready { clean: true, .. }) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a clean teardown, got {other:?}"
        ))),
    }
}

#[then("the failure mentions \"{text}\"")]
fn failure_mentions(session_context: &SessionContext, text: String) -> Result<(), StepError> {
    match &session_context.outcome {
        Some(SessionOutcome::Failed { message, .. }) if message.contains(&text) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a failure mentioning '{text}', got {other:?}"
        ))),
    }
}
