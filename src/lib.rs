//! Core library for the `stf-lease` device reservation tool.
//!
//! A job asks for a device by attribute filter. The crate reserves a matching
//! device from a device farm, connects it through the local debug bridge,
//! streams its log into a temporary file, and hands the job a set of
//! environment bindings. Teardown disconnects, releases, archives the log,
//! and stops the bridge server, whatever happened before.

pub mod bridge;
pub mod broker;
pub mod capture;
pub mod config;
pub mod farm;
pub mod filter;
pub mod session;
pub mod test_support;

pub use bridge::{
    BackgroundProcess, BridgeError, COMMAND_TIMEOUT, CommandOutput, CommandRunner, DebugBridge,
    ProcessCommandRunner,
};
pub use broker::{ConnectionBroker, ConnectionState, DeviceLink, Interrupt};
pub use capture::{CaptureError, CaptureStop, LogCapture};
pub use config::{ConfigError, FarmConfig, SessionConfig};
pub use farm::{
    DeviceFarm, FarmError, FarmFuture, FarmSettings, ReservationFailure, ReservationPolicy,
    ReservedDevice, StfClient,
};
pub use filter::{FilterCondition, FilterError, FilterSpec, FilterValue, JobVariables};
pub use session::{
    AdbKeyPair, JobVerdict, ReservationSession, SessionOptions, SetupError, TeardownFault,
    TeardownReport,
};
