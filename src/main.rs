//! Binary entry point for the `stf-lease` CLI.

mod cli;

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process::{self, Command};

use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stf_lease::{
    ConfigError, ConnectionBroker, DebugBridge, DeviceFarm, FarmConfig, FarmError, FilterError,
    FilterSpec, Interrupt, JobVariables, JobVerdict, ProcessCommandRunner, ReservationSession,
    ReservedDevice, SessionConfig, SessionOptions, SetupError, StfClient,
};

use stf_lease::session::ENV_SERIAL;

use cli::{Cli, DevicesCommand, FilterArgs, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid device filter: {0}")]
    Filter(#[from] FilterError),
    #[error("invalid build variable '{0}': expected KEY=VALUE")]
    Variable(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("device farm error: {0}")]
    Farm(#[from] FarmError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to start job command '{command}': {message}")]
    Job { command: String, message: String },
    #[error("job command terminated without an exit status")]
    MissingExitCode,
}

impl CliError {
    const fn verdict(&self) -> JobVerdict {
        match self {
            Self::Setup(err) => err.verdict(),
            Self::Job { .. } | Self::MissingExitCode => JobVerdict::Failed,
            Self::Filter(_)
            | Self::Variable(_)
            | Self::Config(_)
            | Self::Farm(_)
            | Self::InvalidCommand(_) => JobVerdict::NotBuilt,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.verdict().exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
        Cli::Devices(command) => list_devices(command).await,
        Cli::Check => check_farm().await,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let filter = parse_filter(&args.filter)?;

    let settings = FarmConfig::load_without_cli_args()?.settings()?;
    let session_config = SessionConfig::load_without_cli_args()?;
    session_config.validate()?;

    let interrupt = Interrupt::new();
    watch_ctrl_c(interrupt.clone());
    let bridge = DebugBridge::new(
        ProcessCommandRunner,
        session_config.adb_bin.trim(),
        session_config.adb_server_port,
    );
    let session = ReservationSession::new(
        StfClient::new()?,
        settings,
        ConnectionBroker::new(bridge, interrupt),
        SessionOptions::from_config(&session_config),
    );

    let mut session = session.setup(&filter).await?;
    let outcome = run_job(&args.command, session.environment()).await;
    session.teardown().await;
    outcome
}

async fn list_devices(args: DevicesCommand) -> Result<i32, CliError> {
    let filter = parse_filter(&args.filter)?;
    let settings = FarmConfig::load_without_cli_args()?.settings()?;
    let farm = StfClient::new()?;
    farm.verify(&settings).await?;
    let devices = farm.list_matching(&settings, &filter).await?;
    write_devices(io::stdout(), &devices);
    Ok(0)
}

async fn check_farm() -> Result<i32, CliError> {
    let settings = FarmConfig::load_without_cli_args()?.settings()?;
    StfClient::new()?.verify(&settings).await?;
    writeln!(
        io::stdout(),
        "farm at {} accepted the access token",
        settings.endpoint()
    )
    .ok();
    Ok(0)
}

fn parse_filter(args: &FilterArgs) -> Result<FilterSpec, CliError> {
    let vars = parse_vars(&args.vars, JobVariables::from_process_env())?;
    Ok(FilterSpec::from_args(&args.filters, &vars)?)
}

fn parse_vars(raw: &[String], base: JobVariables) -> Result<JobVariables, CliError> {
    raw.iter().try_fold(base, |vars, pair| match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok(vars.with_build_var(key.trim(), value)),
        _ => Err(CliError::Variable(pair.clone())),
    })
}

fn watch_ctrl_c(interrupt: Interrupt) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; abandoning setup");
            interrupt.raise();
        }
    });
}

async fn run_job(command: &[String], env: BTreeMap<String, String>) -> Result<i32, CliError> {
    let rendered = render_command(command);
    let Some((program, args)) = command.split_first() else {
        return Err(CliError::InvalidCommand(String::from("no command given")));
    };
    let serial = env.get(ENV_SERIAL).map_or("", String::as_str);
    info!(command = %rendered, serial, "running job");

    let mut job = Command::new(program);
    job.args(args).envs(env);
    let status = tokio::task::spawn_blocking(move || job.status())
        .await
        .map_err(|err| CliError::Job {
            command: rendered.clone(),
            message: err.to_string(),
        })?
        .map_err(|err| CliError::Job {
            command: rendered.clone(),
            message: err.to_string(),
        })?;

    let code = status.code().ok_or(CliError::MissingExitCode)?;
    info!(command = %rendered, exit_code = code, "job finished");
    Ok(code)
}

fn render_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn write_devices(mut target: impl Write, devices: &[ReservedDevice]) {
    if devices.is_empty() {
        writeln!(target, "no device matches the filter").ok();
    }
    for device in devices {
        writeln!(target, "{}", device.summary()).ok();
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
