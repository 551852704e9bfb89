//! Setup errors, job verdicts and teardown reports.

use camino::Utf8PathBuf;
use thiserror::Error;

use super::adb_key::AdbKeyError;
use crate::capture::CaptureError;
use crate::farm::FarmError;

/// How a job that could not run should be reported.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobVerdict {
    /// The job never started: configuration, validation or reservation
    /// failed.
    NotBuilt,
    /// The job started but could not complete setup.
    Failed,
    /// The job was interrupted before its command ran.
    Aborted,
}

impl JobVerdict {
    /// Process exit code reported for this verdict.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::NotBuilt => 3,
            Self::Failed => 1,
            Self::Aborted => 130,
        }
    }
}

/// Errors returned by session setup. Every variant raised after a device was
/// reserved has already been through teardown.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SetupError {
    /// Raised when the farm rejects the endpoint or token.
    #[error("device farm check failed: {0}")]
    Verification(#[source] FarmError),
    /// Raised when no device could be reserved.
    #[error("device reservation failed: {0}")]
    Reservation(#[source] FarmError),
    /// Raised when the configured adb key cannot be installed.
    #[error(transparent)]
    AdbKey(#[from] AdbKeyError),
    /// Raised when the log workspace cannot be created.
    #[error("log workspace {path} is unusable: {message}")]
    Workspace {
        /// Workspace directory.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when no device came online in time.
    #[error("no device came online within {timeout_ms}ms: {}", devices.join(", "))]
    ConnectionTimeout {
        /// Bridge identifiers that were polled.
        devices: Vec<String>,
        /// Readiness budget.
        timeout_ms: u128,
    },
    /// Raised when the job is interrupted before setup completes.
    #[error("setup interrupted before the job command ran")]
    Interrupted,
}

impl SetupError {
    /// Verdict the job runner should record for this failure.
    #[must_use]
    pub const fn verdict(&self) -> JobVerdict {
        match self {
            Self::Verification(_) | Self::Reservation(_) | Self::AdbKey(_) => JobVerdict::NotBuilt,
            Self::Workspace { .. } | Self::ConnectionTimeout { .. } => JobVerdict::Failed,
            Self::Interrupted => JobVerdict::Aborted,
        }
    }
}

/// A teardown step that failed. Logged, never propagated.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TeardownFault {
    /// Disconnecting a device failed.
    #[error("disconnect {device}: {message}")]
    Disconnect {
        /// Bridge identifier of the device.
        device: String,
        /// Failure description.
        message: String,
    },
    /// Returning a device to the farm failed.
    #[error("release {serial}: {source}")]
    Release {
        /// Device serial.
        serial: String,
        /// Farm failure.
        #[source]
        source: FarmError,
    },
    /// A log capture step failed.
    #[error("log capture: {0}")]
    Capture(#[from] CaptureError),
    /// Stopping the bridge server failed.
    #[error("kill-server: {message}")]
    KillServer {
        /// Failure description.
        message: String,
    },
}

/// Outcome of a teardown pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownReport {
    /// Steps that failed.
    pub faults: Vec<TeardownFault>,
    /// Serials returned to the farm.
    pub released: Vec<String>,
    /// Archived log files.
    pub archived: Vec<Utf8PathBuf>,
}

impl TeardownReport {
    /// Returns `true` when every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}
