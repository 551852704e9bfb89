//! Renders man pages for `stf-lease` and each of its subcommands.
//!
//! `stf-lease.1` covers the global usage. `stf-lease-run.1`,
//! `stf-lease-devices.1` and `stf-lease-check.1` document the subcommands so
//! CI hosts can `man stf-lease-run` for the filter and environment options.
//! Pages land in `OUT_DIR`.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const BIN: &str = "stf-lease";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    render(&out_dir, BIN, command.clone())?;
    for sub in command.get_subcommands() {
        let title = format!("{BIN}-{}", sub.get_name());
        render(&out_dir, &title, sub.clone())?;
    }
    Ok(())
}

fn render(out_dir: &Path, title: &str, command: Command) -> Result<(), std::io::Error> {
    let mut buffer = Vec::new();
    Man::new(command).title(title).render(&mut buffer)?;
    fs::write(out_dir.join(format!("{title}.1")), buffer)
}
