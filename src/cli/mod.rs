//! Command-line interface definitions for the `stf-lease` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `stf-lease` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stf-lease",
    version,
    about = "Reserve a device-farm device, run a job against it, and release it",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Reserve and connect a device, run a command, then release it.
    #[command(
        name = "run",
        about = "Reserve and connect a device, run a command, then release it"
    )]
    Run(RunCommand),
    /// List devices matching a filter without reserving them.
    #[command(name = "devices", about = "List devices matching a filter")]
    Devices(DevicesCommand),
    /// Check the farm endpoint and access token.
    #[command(name = "check", about = "Check the farm endpoint and access token")]
    Check,
}

/// Device filter and the build variables it may reference.
#[derive(Clone, Debug, Default, Args)]
pub(crate) struct FilterArgs {
    /// Device attribute condition. Wrap the value in slashes for a regular
    /// expression (`sdk=/2[89]/`). Repeat to add conditions.
    #[arg(long = "filter", short = 'f', value_name = "NAME=VALUE")]
    pub(crate) filters: Vec<String>,
    /// Build variable available to `$NAME` references in filter values.
    /// Takes precedence over the process environment.
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub(crate) vars: Vec<String>,
}

/// Arguments for the `stf-lease run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    #[command(flatten)]
    pub(crate) filter: FilterArgs,
    /// Command to execute once a device is online (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `stf-lease devices` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DevicesCommand {
    #[command(flatten)]
    pub(crate) filter: FilterArgs,
}
