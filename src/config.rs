//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::farm::{FarmSettings, ReservationPolicy};

const APP_NAME: &str = "stf-lease";

/// Device farm endpoint and credentials derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STF",
    discovery(
        app_name = "stf-lease",
        env_var = "STF_LEASE_CONFIG_PATH",
        config_file_name = "stf-lease.toml",
        dotfile_name = ".stf-lease.toml",
        project_file_name = "stf-lease.toml"
    )
)]
pub struct FarmConfig {
    /// Base URL of the farm API (for example `https://stf.example.com/api/v1/`).
    #[ortho_config(default = String::new())]
    pub endpoint: String,
    /// Access token sent as a bearer credential.
    #[ortho_config(default = String::new())]
    pub token: String,
    /// Accept invalid TLS certificates presented by the farm.
    #[ortho_config(default = false)]
    pub ignore_cert_error: bool,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in stf-lease.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl FarmConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Ok(Self::load_from_iter([OsString::from(APP_NAME)])?)
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.endpoint,
            &FieldMetadata::new("farm API endpoint", "STF_ENDPOINT", "endpoint", "stf"),
        )?;
        require_field(
            &self.token,
            &FieldMetadata::new("farm access token", "STF_TOKEN", "token", "stf"),
        )?;
        Ok(())
    }

    /// Validates the configuration and freezes it into the settings value
    /// passed to every farm call.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank fields and
    /// [`ConfigError::InvalidEndpoint`] when the endpoint is not a URL.
    pub fn settings(&self) -> Result<FarmSettings, ConfigError> {
        self.validate()?;
        FarmSettings::new(&self.endpoint, &self.token, self.ignore_cert_error)
    }
}

/// Session behaviour: debug-bridge binary, timeouts, and local directories.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STF_SESSION",
    discovery(
        app_name = "stf-lease",
        env_var = "STF_LEASE_CONFIG_PATH",
        config_file_name = "stf-lease.toml",
        dotfile_name = ".stf-lease.toml",
        project_file_name = "stf-lease.toml"
    )
)]
pub struct SessionConfig {
    /// Path to the `adb` executable.
    #[ortho_config(default = "adb".to_owned())]
    pub adb_bin: String,
    /// Port of the local adb server.
    #[ortho_config(default = 5037)]
    pub adb_server_port: u16,
    /// Total time allowed for a reserved device to report ready.
    #[ortho_config(default = 30_000)]
    pub connect_timeout_ms: u64,
    /// Pause after the device reports ready so authorization settles.
    #[ortho_config(default = 5_000)]
    pub settle_delay_ms: u64,
    /// How long to wait for a busy matching device to be released.
    #[ortho_config(default = 0)]
    pub release_wait_minutes: u64,
    /// Reserve every available matching device rather than just one.
    #[ortho_config(default = false)]
    pub reserve_all_matching: bool,
    /// Directory that receives the temporary log files.
    #[ortho_config(default = ".".to_owned())]
    pub workspace_dir: String,
    /// Directory that receives archived logs.
    #[ortho_config(default = "artifacts".to_owned())]
    pub artifact_dir: String,
    /// Public half of a specific adb key to install before connecting.
    pub adb_public_key: Option<String>,
    /// Private half of a specific adb key to install before connecting.
    pub adb_private_key: Option<String>,
    /// Directory holding `adbkey` and `adbkey.pub`. Supports `~/`.
    #[ortho_config(default = "~/.android".to_owned())]
    pub adb_key_dir: String,
}

impl SessionConfig {
    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Ok(Self::load_from_iter([OsString::from(APP_NAME)])?)
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::IncompleteAdbKey`] when only one half of the adb key
    /// pair is configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.adb_bin,
            &FieldMetadata::new("adb binary", "STF_SESSION_ADB_BIN", "adb_bin", "session"),
        )?;
        require_field(
            &self.workspace_dir,
            &FieldMetadata::new(
                "log workspace directory",
                "STF_SESSION_WORKSPACE_DIR",
                "workspace_dir",
                "session",
            ),
        )?;
        require_field(
            &self.artifact_dir,
            &FieldMetadata::new(
                "artifact directory",
                "STF_SESSION_ARTIFACT_DIR",
                "artifact_dir",
                "session",
            ),
        )?;
        let has_public = self
            .adb_public_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        let has_private = self
            .adb_private_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        if has_public != has_private {
            return Err(ConfigError::IncompleteAdbKey);
        }
        if has_public {
            require_field(
                &self.adb_key_dir,
                &FieldMetadata::new(
                    "adb key directory",
                    "STF_SESSION_ADB_KEY_DIR",
                    "adb_key_dir",
                    "session",
                ),
            )?;
        }
        Ok(())
    }

    /// Reservation behaviour derived from this configuration.
    #[must_use]
    pub const fn reservation_policy(&self) -> ReservationPolicy {
        ReservationPolicy {
            wait: Duration::from_secs(self.release_wait_minutes.saturating_mul(60)),
            all_matching: self.reserve_all_matching,
        }
    }

    /// Total time allowed for the connection handshake.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Pause applied after a successful handshake.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Workspace directory as a UTF-8 path.
    #[must_use]
    pub fn workspace_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.workspace_dir.trim())
    }

    /// Artifact directory as a UTF-8 path.
    #[must_use]
    pub fn artifact_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.artifact_dir.trim())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Raised when the farm endpoint is not a usable URL.
    #[error("invalid farm endpoint '{endpoint}': {message}")]
    InvalidEndpoint {
        /// Endpoint as configured.
        endpoint: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when only one half of the adb key pair is configured.
    #[error("adb_public_key and adb_private_key must be configured together")]
    IncompleteAdbKey,
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<Arc<ortho_config::OrthoError>> for ConfigError {
    fn from(value: Arc<ortho_config::OrthoError>) -> Self {
        Self::Parse(value.to_string())
    }
}
