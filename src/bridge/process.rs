//! Host process implementations of the bridge traits.

use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{BackgroundProcess, BridgeError, CommandOutput, CommandRunner};

const WAIT_STEP: Duration = Duration::from_millis(20);

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        timeout: Duration,
    ) -> Result<CommandOutput, BridgeError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| BridgeError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let code = match wait_with_deadline(&mut child, program, timeout) {
            Ok(code) => code,
            Err(err) => {
                kill_quietly(&mut child);
                return Err(err);
            }
        };

        Ok(CommandOutput {
            code,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    fn spawn_logger(
        &self,
        program: &str,
        args: &[OsString],
        sink: File,
    ) -> Result<Box<dyn BackgroundProcess>, BridgeError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| BridgeError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        Ok(Box::new(ChildProcess {
            program: program.to_owned(),
            child,
        }))
    }
}

/// A spawned host process.
#[derive(Debug)]
pub struct ChildProcess {
    program: String,
    child: Child,
}

impl BackgroundProcess for ChildProcess {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self, timeout: Duration) -> Result<(), BridgeError> {
        if !self.is_running() {
            return Ok(());
        }
        self.child.kill().map_err(|err| BridgeError::Wait {
            program: self.program.clone(),
            message: err.to_string(),
        })?;
        wait_with_deadline(&mut self.child, &self.program, timeout).map(|_| ())
    }
}

fn wait_with_deadline(
    child: &mut Child,
    program: &str,
    timeout: Duration,
) -> Result<Option<i32>, BridgeError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code()),
            Ok(None) if Instant::now() >= deadline => {
                return Err(BridgeError::Timeout {
                    program: program.to_owned(),
                    timeout,
                });
            }
            Ok(None) => thread::sleep(WAIT_STEP),
            Err(err) => {
                return Err(BridgeError::Wait {
                    program: program.to_owned(),
                    message: err.to_string(),
                });
            }
        }
    }
}

fn kill_quietly(child: &mut Child) {
    if child.kill().is_ok() {
        drop(child.wait());
    }
}

fn drain<S: Read + Send + 'static>(pipe: Option<S>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut source| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            drop(source.read_to_end(&mut buffer));
            buffer
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|reader| reader.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
