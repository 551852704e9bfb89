//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::bridge::{BackgroundProcess, BridgeError, CommandOutput, CommandRunner};
use crate::broker::Interrupt;
use crate::farm::{
    DeviceFarm, FarmError, FarmFuture, FarmSettings, ReservationFailure, ReservationPolicy,
    ReservedDevice,
};
use crate::filter::FilterSpec;

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Time cap given to the runner; `None` for background processes.
    pub timeout: Option<Duration>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Bridge subcommand of this invocation, skipping global options.
    #[must_use]
    pub fn subcommand(&self) -> Option<String> {
        subcommand_of(&self.args)
    }
}

#[derive(Debug)]
struct LogStream {
    payload: Vec<u8>,
    stays_alive: bool,
}

#[derive(Debug, Default)]
struct RunnerState {
    responses: BTreeMap<String, VecDeque<Result<CommandOutput, BridgeError>>>,
    invocations: Vec<CommandInvocation>,
    log_streams: VecDeque<LogStream>,
    terminations: usize,
}

/// Scripted command runner keyed by bridge subcommand.
///
/// Responses queued for a subcommand are replayed in order and the last one
/// repeats. Unscripted subcommands succeed with empty output. Log streams are
/// queued separately; `spawn_logger` fails once the queue is empty.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues an output for `subcommand` (`devices`, `connect`, `logcat`, ...).
    pub fn push_for(&self, subcommand: &str, output: CommandOutput) {
        self.push_result(subcommand, Ok(output));
    }

    /// Queues a runner error for `subcommand`.
    pub fn push_error_for(&self, subcommand: &str, error: BridgeError) {
        self.push_result(subcommand, Err(error));
    }

    fn push_result(&self, subcommand: &str, result: Result<CommandOutput, BridgeError>) {
        self.state()
            .responses
            .entry(subcommand.to_owned())
            .or_default()
            .push_back(result);
    }

    /// Queues a successful `devices` listing with the given body lines.
    pub fn push_listing(&self, lines: &[&str]) {
        let mut stdout = String::from("List of devices attached\n");
        for line in lines {
            stdout.push_str(line);
            stdout.push('\n');
        }
        self.push_for(
            "devices",
            CommandOutput {
                code: Some(0),
                stdout,
                stderr: String::new(),
            },
        );
    }

    /// Queues a log stream: `payload` is written to the sink on spawn and the
    /// fake process keeps running when `stays_alive` is set.
    pub fn push_log_stream(&self, payload: impl Into<Vec<u8>>, stays_alive: bool) {
        self.state().log_streams.push_back(LogStream {
            payload: payload.into(),
            stays_alive,
        });
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.state().invocations.clone()
    }

    /// Returns the recorded command strings for one subcommand.
    #[must_use]
    pub fn commands_for(&self, subcommand: &str) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|call| call.subcommand().as_deref() == Some(subcommand))
            .map(|call| call.command_string())
            .collect()
    }

    /// Number of times a fake log process was force-terminated.
    #[must_use]
    pub fn terminations(&self) -> usize {
        self.state().terminations
    }

    /// Returns the time caps given to each invocation of one subcommand.
    #[must_use]
    pub fn timeouts_for(&self, subcommand: &str) -> Vec<Duration> {
        self.invocations()
            .into_iter()
            .filter(|call| call.subcommand().as_deref() == Some(subcommand))
            .filter_map(|call| call.timeout)
            .collect()
    }

    fn record(&self, program: &str, args: &[OsString], timeout: Option<Duration>) {
        self.state().invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            timeout,
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        timeout: Duration,
    ) -> Result<CommandOutput, BridgeError> {
        self.record(program, args, Some(timeout));
        let key = subcommand_of(args).unwrap_or_default();
        let mut state = self.state();
        let Some(queue) = state.responses.get_mut(&key) else {
            return Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            });
        };
        if queue.len() > 1 {
            return queue.pop_front().unwrap_or_else(|| Ok(CommandOutput::default()));
        }
        queue
            .front()
            .cloned()
            .unwrap_or_else(|| Ok(CommandOutput::default()))
    }

    fn spawn_logger(
        &self,
        program: &str,
        args: &[OsString],
        mut sink: File,
    ) -> Result<Box<dyn BackgroundProcess>, BridgeError> {
        self.record(program, args, None);
        let Some(stream) = self.state().log_streams.pop_front() else {
            return Err(BridgeError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted log stream available"),
            });
        };
        sink.write_all(&stream.payload)
            .and_then(|()| sink.flush())
            .map_err(|err| BridgeError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        Ok(Box::new(ScriptedProcess {
            running: stream.stays_alive,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Fake background process handed out by [`ScriptedRunner`].
#[derive(Debug)]
pub struct ScriptedProcess {
    running: bool,
    state: Arc<Mutex<RunnerState>>,
}

impl BackgroundProcess for ScriptedProcess {
    fn is_running(&mut self) -> bool {
        self.running
    }

    fn terminate(&mut self, _timeout: Duration) -> Result<(), BridgeError> {
        if self.running {
            self.running = false;
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .terminations += 1;
        }
        Ok(())
    }
}

fn subcommand_of(args: &[OsString]) -> Option<String> {
    let mut iter = args.iter().map(|arg| arg.to_string_lossy().into_owned());
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-P" | "-s" | "-H" => {
                iter.next();
            }
            flag if flag.starts_with('-') => {}
            _ => return Some(arg),
        }
    }
    None
}

/// Builds a reserved device record for tests.
#[must_use]
pub fn scripted_device(serial: &str, connect_url: &str) -> ReservedDevice {
    let record = json!({
        "serial": serial,
        "model": format!("Model {serial}"),
        "sdk": "29",
        "version": "10",
    });
    ReservedDevice::from_record(&record, Some(connect_url)).unwrap_or_else(|| ReservedDevice {
        serial: serial.to_owned(),
        connect_url: connect_url.to_owned(),
        name: serial.to_owned(),
        sdk: None,
        version: None,
        image: None,
        attributes: serde_json::Map::new(),
    })
}

#[derive(Debug)]
struct FarmState {
    verify: Result<(), FarmError>,
    listing: Vec<ReservedDevice>,
    reservation: Result<Vec<ReservedDevice>, ReservationFailure>,
    failing_releases: BTreeSet<String>,
    calls: Vec<String>,
    released: Vec<String>,
}

/// Scripted device farm recording every call.
#[derive(Clone, Debug)]
pub struct ScriptedFarm {
    state: Arc<Mutex<FarmState>>,
}

impl Default for ScriptedFarm {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(FarmState {
                verify: Ok(()),
                listing: Vec::new(),
                reservation: Err(FarmError::NoMatchingDevice.into()),
                failing_releases: BTreeSet::new(),
                calls: Vec::new(),
                released: Vec::new(),
            })),
        }
    }
}

impl ScriptedFarm {
    /// Creates a farm with no matching devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FarmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes reservations succeed with `devices`, which are also listed.
    #[must_use]
    pub fn with_devices(self, devices: Vec<ReservedDevice>) -> Self {
        {
            let mut state = self.state();
            state.listing.clone_from(&devices);
            state.reservation = Ok(devices);
        }
        self
    }

    /// Makes reservations fail with `failure`.
    #[must_use]
    pub fn with_reservation_failure(self, failure: ReservationFailure) -> Self {
        self.state().reservation = Err(failure);
        self
    }

    /// Makes the configuration check fail with `error`.
    #[must_use]
    pub fn with_verify_failure(self, error: FarmError) -> Self {
        self.state().verify = Err(error);
        self
    }

    /// Makes releases of `serial` fail.
    #[must_use]
    pub fn failing_release(self, serial: &str) -> Self {
        self.state().failing_releases.insert(serial.to_owned());
        self
    }

    /// All calls made so far (`verify`, `list`, `reserve`, `release <serial>`).
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Serials whose release was attempted, in order.
    #[must_use]
    pub fn released(&self) -> Vec<String> {
        self.state().released.clone()
    }
}

impl DeviceFarm for ScriptedFarm {
    fn verify<'a>(&'a self, _settings: &'a FarmSettings) -> FarmFuture<'a, (), FarmError> {
        let result = {
            let mut state = self.state();
            state.calls.push(String::from("verify"));
            state.verify.clone()
        };
        Box::pin(async move { result })
    }

    fn list_matching<'a>(
        &'a self,
        _settings: &'a FarmSettings,
        _filter: &'a FilterSpec,
    ) -> FarmFuture<'a, Vec<ReservedDevice>, FarmError> {
        let listing = {
            let mut state = self.state();
            state.calls.push(String::from("list"));
            state.listing.clone()
        };
        Box::pin(async move { Ok(listing) })
    }

    fn reserve<'a>(
        &'a self,
        _settings: &'a FarmSettings,
        _filter: &'a FilterSpec,
        _policy: ReservationPolicy,
        interrupt: &'a Interrupt,
    ) -> FarmFuture<'a, Vec<ReservedDevice>, ReservationFailure> {
        let result = {
            let mut state = self.state();
            state.calls.push(String::from("reserve"));
            if interrupt.is_raised() {
                Err(FarmError::Interrupted.into())
            } else {
                state.reservation.clone()
            }
        };
        Box::pin(async move { result })
    }

    fn release<'a>(
        &'a self,
        _settings: &'a FarmSettings,
        device: &'a ReservedDevice,
    ) -> FarmFuture<'a, (), FarmError> {
        let result = {
            let mut state = self.state();
            state.calls.push(format!("release {}", device.serial));
            state.released.push(device.serial.clone());
            if state.failing_releases.contains(&device.serial) {
                Err(FarmError::Rejected {
                    action: String::from("release"),
                    serial: device.serial.clone(),
                    message: String::from("simulated failure"),
                })
            } else {
                Ok(())
            }
        };
        Box::pin(async move { result })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs, &[]).await
    }

    /// Sets `pairs` and removes `unset` while holding the global mutex.
    pub async fn apply(pairs: &[(&str, &str)], unset: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(unset.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + unset.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
        }
        for key in unset {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
