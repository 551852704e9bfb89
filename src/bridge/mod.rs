//! Debug-bridge command execution.
//!
//! Every call to the `adb` CLI goes through a [`CommandRunner`] so sessions can
//! be driven by scripted runners in tests. Short-lived commands are bounded by
//! a timeout; log streaming runs as a [`BackgroundProcess`] writing straight
//! into a file the caller owns.

mod process;

use std::ffi::OsString;
use std::fmt::Debug;
use std::fs::File;
use std::time::Duration;

use thiserror::Error;

pub use process::{ChildProcess, ProcessCommandRunner};

/// Upper bound for short-lived bridge commands.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors surfaced while running bridge commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BridgeError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command outlives its time cap and is killed.
    #[error("{program} did not finish within {}ms", timeout.as_millis())]
    Timeout {
        /// Command that was killed.
        program: String,
        /// Cap that was exceeded.
        timeout: Duration,
    },
    /// Raised when waiting on or killing a process fails.
    #[error("failed to wait for {program}: {message}")]
    Wait {
        /// Command being waited on.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// A long-running child process owned by its caller.
pub trait BackgroundProcess: Debug + Send {
    /// Returns `true` while the process has not exited.
    fn is_running(&mut self) -> bool;

    /// Kills the process and waits up to `timeout` for it to be reaped.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Wait`] when the kill cannot be delivered or
    /// [`BridgeError::Timeout`] when the process outlives `timeout`.
    fn terminate(&mut self, timeout: Duration) -> Result<(), BridgeError>;
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with `args`, capturing stdout and stderr, and kills it
    /// once `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Spawn`] if the command cannot be started and
    /// [`BridgeError::Timeout`] if it had to be killed.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        timeout: Duration,
    ) -> Result<CommandOutput, BridgeError>;

    /// Starts `program` in the background with stdout redirected to `sink`
    /// and stderr discarded.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Spawn`] if the process cannot be started.
    fn spawn_logger(
        &self,
        program: &str,
        args: &[OsString],
        sink: File,
    ) -> Result<Box<dyn BackgroundProcess>, BridgeError>;
}

/// Builds `adb` invocations against a fixed server port.
#[derive(Clone, Debug)]
pub struct DebugBridge<R: CommandRunner> {
    runner: R,
    program: String,
    port: u16,
}

impl<R: CommandRunner> DebugBridge<R> {
    /// Creates a bridge that runs `program` through `runner`.
    #[must_use]
    pub fn new(runner: R, program: impl Into<String>, port: u16) -> Self {
        Self {
            runner,
            program: program.into(),
            port,
        }
    }

    /// Port of the local bridge server.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Bridge executable name or path.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runner used for all invocations.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    fn args(&self, target: Option<&str>, rest: &[&str]) -> Vec<OsString> {
        let mut args = Vec::with_capacity(rest.len() + 4);
        args.push(OsString::from("-P"));
        args.push(OsString::from(self.port.to_string()));
        if let Some(serial) = target {
            args.push(OsString::from("-s"));
            args.push(OsString::from(serial));
        }
        args.extend(rest.iter().map(OsString::from));
        args
    }

    fn run(&self, target: Option<&str>, rest: &[&str]) -> Result<CommandOutput, BridgeError> {
        self.run_within(target, rest, COMMAND_TIMEOUT)
    }

    fn run_within(
        &self,
        target: Option<&str>,
        rest: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, BridgeError> {
        let args = self.args(target, rest);
        self.runner.run(&self.program, &args, timeout)
    }

    /// `adb connect <target>`.
    ///
    /// # Errors
    ///
    /// Propagates runner failures.
    pub fn connect(&self, target: &str) -> Result<CommandOutput, BridgeError> {
        self.run(None, &["connect", target])
    }

    /// `adb disconnect <target>`.
    ///
    /// # Errors
    ///
    /// Propagates runner failures.
    pub fn disconnect(&self, target: &str) -> Result<CommandOutput, BridgeError> {
        self.run(None, &["disconnect", target])
    }

    /// `adb devices`, killed after `timeout` or [`COMMAND_TIMEOUT`],
    /// whichever is shorter.
    ///
    /// # Errors
    ///
    /// Propagates runner failures.
    pub fn devices(&self, timeout: Duration) -> Result<CommandOutput, BridgeError> {
        self.run_within(None, &["devices"], timeout.min(COMMAND_TIMEOUT))
    }

    /// `adb start-server`.
    ///
    /// # Errors
    ///
    /// Propagates runner failures.
    pub fn start_server(&self) -> Result<CommandOutput, BridgeError> {
        self.run(None, &["start-server"])
    }

    /// `adb kill-server`.
    ///
    /// # Errors
    ///
    /// Propagates runner failures.
    pub fn kill_server(&self) -> Result<CommandOutput, BridgeError> {
        self.run(None, &["kill-server"])
    }

    /// `adb -s <target> logcat -c`.
    ///
    /// # Errors
    ///
    /// Propagates runner failures.
    pub fn clear_log(&self, target: &str) -> Result<CommandOutput, BridgeError> {
        self.run(Some(target), &["logcat", "-c"])
    }

    /// Starts `adb -s <target> logcat -v time` writing into `sink`.
    ///
    /// # Errors
    ///
    /// Propagates runner failures.
    pub fn stream_log(
        &self,
        target: &str,
        sink: File,
    ) -> Result<Box<dyn BackgroundProcess>, BridgeError> {
        let args = self.args(Some(target), &["logcat", "-v", "time"]);
        self.runner.spawn_logger(&self.program, &args, sink)
    }
}
