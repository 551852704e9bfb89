//! Reservation lifecycle for one job.
//!
//! A [`ReservationSession`] reserves devices, installs the adb key, starts the
//! bridge server, starts one log capture per device, connects, and waits for a
//! device to come online. Every failure after the first reservation routes
//! through [`ReservationSession::teardown`] before it is returned. Teardown is
//! total: it runs every step, collects faults into a [`TeardownReport`], and
//! never fails.

pub mod adb_key;
mod error;

use std::collections::BTreeMap;
use std::iter;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::time::sleep;
use tracing::{Instrument, Span, info, info_span, warn};
use uuid::Uuid;

use crate::bridge::CommandRunner;
use crate::broker::{ConnectionBroker, ConnectionState, DeviceLink};
use crate::capture::LogCapture;
use crate::config::SessionConfig;
use crate::farm::{DeviceFarm, FarmError, FarmSettings, ReservationPolicy, ReservedDevice};
use crate::filter::FilterSpec;

pub use adb_key::{AdbKeyError, AdbKeyPair};
pub use error::{JobVerdict, SetupError, TeardownFault, TeardownReport};

/// Environment variable naming the device serial for the job.
pub const ENV_SERIAL: &str = "ANDROID_SERIAL";
/// Environment variable naming the connected device for emulator-aware tools.
pub const ENV_AVD_DEVICE: &str = "ANDROID_AVD_DEVICE";
/// Environment variable carrying the bridge server port.
pub const ENV_ADB_PORT: &str = "ANDROID_ADB_SERVER_PORT";
/// Environment variable carrying the live log file path.
pub const ENV_LOGCAT_FILE: &str = "ANDROID_TMP_LOGCAT_FILE";

/// Tunables for one session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Busy-device wait and multi-device reservation.
    pub policy: ReservationPolicy,
    /// Readiness budget for `await_ready`.
    pub connect_timeout: Duration,
    /// Pause after the first device is ready.
    pub settle_delay: Duration,
    /// Directory for temporary log files.
    pub workspace: Utf8PathBuf,
    /// Directory receiving archived logs.
    pub artifact_dir: Utf8PathBuf,
    /// Key pair installed before the server starts.
    pub adb_keys: Option<AdbKeyPair>,
    /// Directory receiving the key pair.
    pub adb_key_dir: String,
}

impl SessionOptions {
    /// Builds options from loaded configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        let adb_keys = non_blank(config.adb_public_key.as_deref())
            .zip(non_blank(config.adb_private_key.as_deref()))
            .map(|(public, private)| AdbKeyPair::new(public, private));
        Self {
            policy: config.reservation_policy(),
            connect_timeout: config.connect_timeout(),
            settle_delay: config.settle_delay(),
            workspace: config.workspace_path(),
            artifact_dir: config.artifact_path(),
            adb_keys,
            adb_key_dir: config.adb_key_dir.clone(),
        }
    }
}

/// Everything held for one reserved device.
#[derive(Debug)]
pub struct DeviceSlot {
    /// Device as reserved from the farm.
    pub device: ReservedDevice,
    /// Bridge connection bookkeeping.
    pub link: DeviceLink,
    /// Log capture, pending until the captures start.
    pub capture: LogCapture,
}

impl DeviceSlot {
    fn new(device: ReservedDevice) -> Self {
        let link = DeviceLink::new(device.bridge_id());
        let capture = LogCapture::pending(device.serial.clone());
        Self {
            device,
            link,
            capture,
        }
    }
}

/// Devices, connections and captures leased for one job.
#[derive(Debug)]
pub struct ReservationSession<F: DeviceFarm, R: CommandRunner> {
    id: Uuid,
    span: Span,
    farm: F,
    settings: FarmSettings,
    broker: ConnectionBroker<R>,
    options: SessionOptions,
    slots: BTreeMap<String, DeviceSlot>,
    torn_down: bool,
}

impl<F: DeviceFarm, R: CommandRunner> ReservationSession<F, R> {
    /// Creates a session that has not reserved anything yet.
    #[must_use]
    pub fn new(
        farm: F,
        settings: FarmSettings,
        broker: ConnectionBroker<R>,
        options: SessionOptions,
    ) -> Self {
        let id = Uuid::new_v4();
        let span = info_span!("session", session_id = %id);
        Self {
            id,
            span,
            farm,
            settings,
            broker,
            options,
            slots: BTreeMap::new(),
            torn_down: false,
        }
    }

    /// Random identifier attached to this session's log events.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Per-device slots keyed by serial.
    #[must_use]
    pub const fn slots(&self) -> &BTreeMap<String, DeviceSlot> {
        &self.slots
    }

    /// Reserved devices in serial order.
    pub fn devices(&self) -> impl Iterator<Item = &ReservedDevice> {
        self.slots.values().map(|slot| &slot.device)
    }

    /// Reserves and connects devices matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`]. A farm check failure, a reservation that
    /// claimed nothing, or an interrupt raised before any claim returns
    /// without side effects; every other failure is returned after teardown.
    pub async fn setup(mut self, filter: &FilterSpec) -> Result<Self, SetupError> {
        let span = self.span.clone();
        async move {
            match self.prepare(filter).await {
                Ok(()) => Ok(self),
                Err(err) => {
                    if !self.slots.is_empty() {
                        self.teardown().await;
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn prepare(&mut self, filter: &FilterSpec) -> Result<(), SetupError> {
        self.farm
            .verify(&self.settings)
            .await
            .map_err(SetupError::Verification)?;

        self.check_interrupt()?;
        let interrupt = self.broker.interrupt().clone();
        let reserved = match self
            .farm
            .reserve(&self.settings, filter, self.options.policy, &interrupt)
            .await
        {
            Ok(devices) => devices,
            Err(failure) => {
                self.adopt(failure.reserved);
                return Err(match failure.error {
                    FarmError::Interrupted => SetupError::Interrupted,
                    error => SetupError::Reservation(error),
                });
            }
        };
        self.adopt(reserved);
        self.check_interrupt()?;

        if let Some(keys) = &self.options.adb_keys {
            keys.install(&self.options.adb_key_dir)?;
        }

        self.broker.start_server();
        ensure_workspace(&self.options.workspace)?;
        self.check_interrupt()?;

        let bridge = self.broker.bridge();
        for slot in self.slots.values_mut() {
            slot.capture = LogCapture::start(
                bridge,
                slot.device.bridge_id(),
                &slot.device.serial,
                &self.options.workspace,
            );
        }

        for slot in self.slots.values_mut() {
            self.broker.connect(&mut slot.link);
        }

        let timeout = self.options.connect_timeout;
        let ready = self
            .broker
            .await_ready(self.slots.values_mut().map(|slot| &mut slot.link), timeout)
            .await;
        self.check_interrupt()?;
        if !ready {
            return Err(SetupError::ConnectionTimeout {
                devices: self
                    .slots
                    .values()
                    .map(|slot| slot.link.bridge_id().to_owned())
                    .collect(),
                timeout_ms: timeout.as_millis(),
            });
        }

        info!(
            delay_ms = self.options.settle_delay.as_millis(),
            "device online; letting authorisation settle"
        );
        sleep(self.options.settle_delay).await;
        Ok(())
    }

    fn check_interrupt(&self) -> Result<(), SetupError> {
        if self.broker.interrupt().is_raised() {
            warn!(devices = self.slots.len(), "interrupted during setup");
            return Err(SetupError::Interrupted);
        }
        Ok(())
    }

    fn adopt(&mut self, devices: Vec<ReservedDevice>) {
        for device in devices {
            let icon = device
                .icon_url(self.settings.endpoint())
                .map(|url| url.to_string())
                .unwrap_or_default();
            info!(device = %device.summary(), %icon, "reserved device");
            self.slots
                .insert(device.serial.clone(), DeviceSlot::new(device));
        }
    }

    fn primary(&self) -> Option<&DeviceSlot> {
        self.slots
            .values()
            .find(|slot| slot.link.state() == ConnectionState::Connected)
            .or_else(|| self.slots.values().next())
    }

    /// Variables the job command runs with: the device serial, the bridge
    /// port and, when a capture is running, the live log file.
    #[must_use]
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        let Some(primary) = self.primary() else {
            return vars;
        };
        let serial = primary.device.bridge_id().to_owned();
        vars.insert(String::from(ENV_SERIAL), serial.clone());
        vars.insert(String::from(ENV_AVD_DEVICE), serial);
        vars.insert(
            String::from(ENV_ADB_PORT),
            self.broker.bridge().port().to_string(),
        );
        let log_file = iter::once(&primary.capture)
            .chain(self.slots.values().map(|slot| &slot.capture))
            .find(|capture| capture.is_available())
            .and_then(LogCapture::path);
        if let Some(path) = log_file {
            vars.insert(String::from(ENV_LOGCAT_FILE), path.to_string());
        }
        vars
    }

    /// Disconnects and releases every device, stops every capture and stops
    /// the bridge server.
    ///
    /// Every step runs regardless of earlier failures. Faults are logged and
    /// returned. A second call returns an empty report.
    pub async fn teardown(&mut self) -> TeardownReport {
        if self.torn_down {
            return TeardownReport::default();
        }
        self.torn_down = true;
        let span = self.span.clone();
        async move {
            let mut report = TeardownReport::default();

            for slot in self.slots.values_mut() {
                if let Some(message) = self.broker.disconnect(&mut slot.link) {
                    report.faults.push(TeardownFault::Disconnect {
                        device: slot.link.bridge_id().to_owned(),
                        message,
                    });
                }
            }

            for slot in self.slots.values() {
                match self.farm.release(&self.settings, &slot.device).await {
                    Ok(()) => {
                        info!(serial = %slot.device.serial, "released device");
                        report.released.push(slot.device.serial.clone());
                    }
                    Err(source) => report.faults.push(TeardownFault::Release {
                        serial: slot.device.serial.clone(),
                        source,
                    }),
                }
            }

            for slot in self.slots.values_mut() {
                let stop = slot.capture.stop(&self.options.artifact_dir).await;
                report.archived.extend(stop.archived);
                report
                    .faults
                    .extend(stop.faults.into_iter().map(TeardownFault::Capture));
            }

            if let Some(message) = self.broker.kill_server() {
                report.faults.push(TeardownFault::KillServer { message });
            }

            self.broker
                .reset(self.slots.values_mut().map(|slot| &mut slot.link));

            for fault in &report.faults {
                warn!(error = %fault, "teardown step failed");
            }
            info!(
                released = report.released.len(),
                archived = report.archived.len(),
                faults = report.faults.len(),
                "session torn down"
            );
            report
        }
        .instrument(span)
        .await
    }
}

impl<F: DeviceFarm, R: CommandRunner> Drop for ReservationSession<F, R> {
    fn drop(&mut self) {
        if !self.torn_down && !self.slots.is_empty() {
            warn!(
                session_id = %self.id,
                devices = self.slots.len(),
                "session dropped without teardown; devices stay reserved"
            );
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|text| !text.trim().is_empty())
}

fn ensure_workspace(path: &Utf8Path) -> Result<(), SetupError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| SetupError::Workspace {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests;
