//! Shared fixtures for session BDD scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::fixture;
use stf_lease::test_support::{ScriptedFarm, ScriptedRunner};
use stf_lease::{
    ConnectionBroker, DebugBridge, FarmSettings, Interrupt, ReservationPolicy, ReservationSession,
    SessionOptions,
};
use tempfile::TempDir;
use thiserror::Error;

/// Bridge server port used by every scenario.
pub const ADB_PORT: u16 = 5037;

#[derive(Clone, Debug)]
pub struct SessionContext {
    pub farm: ScriptedFarm,
    pub runner: ScriptedRunner,
    pub root: Utf8PathBuf,
    pub outcome: Option<SessionOutcome>,
    pub(crate) _root_tmp: Arc<TempDir>,
}

#[derive(Clone, Debug)]
pub enum SessionOutcome {
    Ready {
        environment: BTreeMap<String, String>,
        clean: bool,
    },
    Failed {
        exit_code: i32,
        message: String,
    },
}

#[derive(Clone, Debug, Error)]
pub enum SessionTestError {
    #[error("failed to create workspace: {0}")]
    Workspace(String),
}

#[fixture]
pub fn session_context_result() -> Result<SessionContext, SessionTestError> {
    build_session_context()
}

#[fixture]
pub fn session_context(
    session_context_result: Result<SessionContext, SessionTestError>,
) -> SessionContext {
    session_context_result
        .unwrap_or_else(|err| panic!("session context fixture should initialise: {err}"))
}

pub fn build_session_context() -> Result<SessionContext, SessionTestError> {
    let tmp_dir =
        TempDir::new().map_err(|err| SessionTestError::Workspace(format!("tempdir: {err}")))?;
    let root = Utf8PathBuf::from_path_buf(tmp_dir.path().to_path_buf()).map_err(|path| {
        SessionTestError::Workspace(format!("non-utf8 tempdir path: {}", path.display()))
    })?;

    Ok(SessionContext {
        farm: ScriptedFarm::new(),
        runner: ScriptedRunner::new(),
        root,
        outcome: None,
        _root_tmp: Arc::new(tmp_dir),
    })
}

impl SessionContext {
    /// Builds a session over the scripted farm and runner with short waits.
    pub fn session(&self) -> ReservationSession<ScriptedFarm, ScriptedRunner> {
        let broker = ConnectionBroker::new(
            DebugBridge::new(self.runner.clone(), "adb", ADB_PORT),
            Interrupt::new(),
        );
        let settings = FarmSettings::new("https://stf.example.com/api/v1", "token", false)
            .unwrap_or_else(|err| panic!("farm settings fixture should be valid: {err}"));
        ReservationSession::new(self.farm.clone(), settings, broker, self.options())
    }

    fn options(&self) -> SessionOptions {
        SessionOptions {
            policy: ReservationPolicy::default(),
            connect_timeout: Duration::from_millis(300),
            settle_delay: Duration::ZERO,
            workspace: self.root.join("workspace"),
            artifact_dir: self.root.join("artifacts"),
            adb_keys: None,
            adb_key_dir: self.root.join("keys").to_string(),
        }
    }
}
