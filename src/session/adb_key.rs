//! Installs a configured adb key pair before the bridge server starts.
//!
//! Farm devices only authorise hosts whose key they already trust, so jobs
//! can supply the farm's key pair. Existing keys in the target directory are
//! overwritten.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, OpenOptions};
use thiserror::Error;
use tracing::info;

const PRIVATE_KEY_FILE: &str = "adbkey";
const PUBLIC_KEY_FILE: &str = "adbkey.pub";
/// Owner-only access for the private half.
const PRIVATE_KEY_MODE: u32 = 0o600;
const PUBLIC_KEY_MODE: u32 = 0o644;

/// Errors raised while writing the key pair.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("cannot write adb key to {path}: {message}")]
pub struct AdbKeyError {
    /// File or directory that could not be written.
    pub path: Utf8PathBuf,
    /// Operating system error string.
    pub message: String,
}

/// A public/private adb key pair.
#[derive(Clone, Eq, PartialEq)]
pub struct AdbKeyPair {
    public: String,
    private: String,
}

impl std::fmt::Debug for AdbKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbKeyPair")
            .field("public", &self.public)
            .field("private", &"<redacted>")
            .finish()
    }
}

impl AdbKeyPair {
    /// Pairs the two halves of a key.
    #[must_use]
    pub fn new(public: impl Into<String>, private: impl Into<String>) -> Self {
        Self {
            public: public.into(),
            private: private.into(),
        }
    }

    /// Writes `adbkey` and `adbkey.pub` into `dir` (a leading `~/` is
    /// expanded), creating it when needed, and returns the resolved
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`AdbKeyError`] when the directory cannot be created or a file
    /// cannot be written.
    pub fn install(&self, dir: &str) -> Result<Utf8PathBuf, AdbKeyError> {
        let target = Utf8PathBuf::from(expand_tilde(dir));
        info!(dir = %target, "installing adb key pair; existing keys are overwritten");
        let handle = open_dir(&target)?;
        for (name, contents, mode) in [
            (PRIVATE_KEY_FILE, &self.private, PRIVATE_KEY_MODE),
            (PUBLIC_KEY_FILE, &self.public, PUBLIC_KEY_MODE),
        ] {
            write_key(&handle, name, contents, mode).map_err(|err| AdbKeyError {
                path: target.join(name),
                message: err.to_string(),
            })?;
        }
        Ok(target)
    }
}

/// Writes `contents` to `name`, creating it with `mode` on unix and
/// resetting the mode of a file that already exists.
fn write_key(dir: &Dir, name: &str, contents: &str, mode: u32) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    restrict_new(&mut options, mode);
    let mut file = dir.open_with(name, &options)?;
    restrict_existing(&file, mode)?;
    file.write_all(contents.as_bytes())?;
    file.flush()
}

#[cfg(unix)]
fn restrict_new(options: &mut OpenOptions, mode: u32) {
    use cap_std::fs::OpenOptionsExt;
    options.mode(mode);
}

#[cfg(not(unix))]
const fn restrict_new(_options: &mut OpenOptions, _mode: u32) {}

#[cfg(unix)]
fn restrict_existing(file: &cap_std::fs_utf8::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(cap_std::fs::Permissions::from_std(
        std::fs::Permissions::from_mode(mode),
    ))
}

#[cfg(not(unix))]
const fn restrict_existing(_file: &cap_std::fs_utf8::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn open_dir(path: &Utf8Path) -> Result<Dir, AdbKeyError> {
    let fail = |err: std::io::Error| AdbKeyError {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(fail)?;
    Dir::open_ambient_dir(path, ambient_authority()).map_err(fail)
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
