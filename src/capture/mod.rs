//! Per-device log capture.
//!
//! A capture clears the device's log buffer, then streams `logcat` into a
//! uniquely named file in the workspace. The streaming process runs on its own
//! and only communicates through that file. Any failure while starting leaves
//! the capture unavailable instead of failing the session. Stopping always
//! runs every step: stop the process, close the stream, archive a non-empty
//! log, delete the temporary file.

use std::fs::File;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tempfile::Builder;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::bridge::{BackgroundProcess, BridgeError, CommandRunner, DebugBridge};

/// How long a logger may take to exit on its own once its device is gone.
pub const LOG_GRACE_PERIOD: Duration = Duration::from_secs(3);
const GRACE_STEP: Duration = Duration::from_millis(100);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Non-fatal log capture failures.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CaptureError {
    /// Raised when the log file cannot be created in the workspace.
    #[error("cannot create log file for {serial} in {workspace}: {message}")]
    LogFile {
        /// Device whose log was being captured.
        serial: String,
        /// Workspace directory used for temporary logs.
        workspace: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the streaming process cannot be started.
    #[error("cannot start logger for {serial}: {source}")]
    Logger {
        /// Device whose log was being captured.
        serial: String,
        /// Underlying bridge failure.
        #[source]
        source: BridgeError,
    },
    /// Raised when a lingering logger cannot be killed.
    #[error("cannot stop logger for {serial}: {source}")]
    Terminate {
        /// Device whose log was being captured.
        serial: String,
        /// Underlying bridge failure.
        #[source]
        source: BridgeError,
    },
    /// Raised when the log cannot be copied to the artifact directory.
    #[error("cannot archive {path}: {message}")]
    Archive {
        /// Log file being archived.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the temporary log cannot be removed.
    #[error("cannot delete {path}: {message}")]
    Delete {
        /// Log file being removed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Result of stopping a capture.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CaptureStop {
    /// Archived copy of the log, when it had content.
    pub archived: Option<Utf8PathBuf>,
    /// Steps that failed; later steps still ran.
    pub faults: Vec<CaptureError>,
}

/// Log capture handle for one device.
#[derive(Debug)]
pub struct LogCapture {
    serial: String,
    path: Option<Utf8PathBuf>,
    stream: Option<File>,
    process: Option<Box<dyn BackgroundProcess>>,
    fault: Option<CaptureError>,
}

impl LogCapture {
    /// Placeholder for a device whose capture has not been started.
    #[must_use]
    pub fn pending(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            path: None,
            stream: None,
            process: None,
            fault: None,
        }
    }

    /// Clears the device's log buffer and starts streaming its log into a
    /// new file under `workspace`.
    ///
    /// Never fails: problems are recorded and leave the capture unavailable.
    #[must_use]
    pub fn start<R: CommandRunner>(
        bridge: &DebugBridge<R>,
        target: &str,
        serial: &str,
        workspace: &Utf8Path,
    ) -> Self {
        let mut capture = Self::pending(serial);

        match bridge.clear_log(target) {
            Ok(output) if output.is_success() => {}
            Ok(output) => debug!(
                device = target,
                status = %output.status_text(),
                "clearing log buffer failed"
            ),
            Err(err) => debug!(device = target, error = %err, "clearing log buffer failed"),
        }

        let (file, path) = match create_log_file(serial, workspace) {
            Ok(created) => created,
            Err(message) => {
                return capture.unavailable(CaptureError::LogFile {
                    serial: serial.to_owned(),
                    workspace: workspace.to_path_buf(),
                    message,
                });
            }
        };
        capture.path = Some(path);

        let sink = match file.try_clone() {
            Ok(sink) => sink,
            Err(err) => {
                return capture.unavailable(CaptureError::LogFile {
                    serial: serial.to_owned(),
                    workspace: workspace.to_path_buf(),
                    message: err.to_string(),
                });
            }
        };
        capture.stream = Some(file);

        match bridge.stream_log(target, sink) {
            Ok(process) => {
                info!(device = target, path = ?capture.path, "capturing device log");
                capture.process = Some(process);
                capture
            }
            Err(source) => capture.unavailable(CaptureError::Logger {
                serial: serial.to_owned(),
                source,
            }),
        }
    }

    fn unavailable(mut self, fault: CaptureError) -> Self {
        warn!(device = %self.serial, error = %fault, "log capture unavailable");
        self.stream = None;
        self.process = None;
        self.fault = Some(fault);
        self
    }

    /// Device serial this capture belongs to.
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Returns `true` while a logger is attached.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.process.is_some()
    }

    /// Temporary log file, when one was created.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Why the capture is unavailable, if it failed to start.
    #[must_use]
    pub const fn fault(&self) -> Option<&CaptureError> {
        self.fault.as_ref()
    }

    /// Stops the logger, closes the stream, archives a non-empty log into
    /// `artifact_dir` under its file name, and deletes the temporary file.
    ///
    /// Each step runs even when an earlier one failed. Calling this again is
    /// a no-op.
    pub async fn stop(&mut self, artifact_dir: &Utf8Path) -> CaptureStop {
        let mut outcome = CaptureStop::default();

        if let Some(fault) = self.stop_process().await {
            outcome.faults.push(fault);
        }

        if let Some(stream) = self.stream.take() {
            drop(stream.sync_all());
        }

        let Some(path) = self.path.take() else {
            return outcome;
        };

        match archive(&path, artifact_dir) {
            Ok(Some(archived)) => {
                info!(device = %self.serial, path = %archived, "archived device log");
                outcome.archived = Some(archived);
            }
            Ok(None) => debug!(device = %self.serial, "device log is empty; not archiving"),
            Err(message) => outcome.faults.push(CaptureError::Archive {
                path: path.clone(),
                message,
            }),
        }

        if let Err(message) = remove(&path) {
            outcome.faults.push(CaptureError::Delete { path, message });
        }

        for fault in &outcome.faults {
            warn!(device = %self.serial, error = %fault, "log capture teardown step failed");
        }
        outcome
    }

    async fn stop_process(&mut self) -> Option<CaptureError> {
        let mut process = self.process.take()?;
        let deadline = Instant::now() + LOG_GRACE_PERIOD;
        while process.is_running() && Instant::now() < deadline {
            sleep(GRACE_STEP).await;
        }
        if !process.is_running() {
            return None;
        }
        debug!(device = %self.serial, "logger still running after grace period; terminating");
        process
            .terminate(TERMINATE_TIMEOUT)
            .err()
            .map(|source| CaptureError::Terminate {
                serial: self.serial.clone(),
                source,
            })
    }
}

fn sanitise(serial: &str) -> String {
    serial
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

fn create_log_file(serial: &str, workspace: &Utf8Path) -> Result<(File, Utf8PathBuf), String> {
    let prefix = format!("logcat_{}_", sanitise(serial));
    let named = Builder::new()
        .prefix(&prefix)
        .suffix(".log")
        .tempfile_in(workspace)
        .map_err(|err| err.to_string())?;
    let (file, path) = named.keep().map_err(|err| err.to_string())?;
    let utf8 = Utf8PathBuf::from_path_buf(path)
        .map_err(|raw| format!("log path is not UTF-8: {}", raw.display()))?;
    Ok((file, utf8))
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), String> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| format!("path has no file name: {path}"))?;
    Ok((parent, name))
}

fn archive(path: &Utf8Path, artifact_dir: &Utf8Path) -> Result<Option<Utf8PathBuf>, String> {
    let (parent, name) = split(path)?;
    let source = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| err.to_string())?;
    let length = match source.metadata(name) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err.to_string()),
    };
    if length == 0 {
        return Ok(None);
    }

    Dir::create_ambient_dir_all(artifact_dir, ambient_authority()).map_err(|err| err.to_string())?;
    let target =
        Dir::open_ambient_dir(artifact_dir, ambient_authority()).map_err(|err| err.to_string())?;
    source
        .copy(name, &target, name)
        .map_err(|err| err.to_string())?;
    Ok(Some(artifact_dir.join(name)))
}

fn remove(path: &Utf8Path) -> Result<(), String> {
    let (parent, name) = split(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| err.to_string())?;
    match dir.remove_file(name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.to_string()),
    }
}
