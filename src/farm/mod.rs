//! Device farm abstraction for reserving and releasing remote devices.
//!
//! The farm is treated as a black-box reservation service. Every call takes
//! an explicit [`FarmSettings`] value so concurrent callers can never observe
//! each other's endpoint, token, or TLS choice.

mod device;
mod settings;
mod stf;
mod types;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::broker::Interrupt;
use crate::filter::FilterSpec;

pub use device::ReservedDevice;
pub use settings::FarmSettings;
pub use stf::StfClient;

/// Future returned by farm operations.
pub type FarmFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// How a reservation should treat busy devices and multiple matches.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReservationPolicy {
    /// How long to keep polling when matching devices exist but none is free.
    /// Zero checks availability once.
    pub wait: Duration,
    /// Reserve every available matching device instead of only the first.
    pub all_matching: bool,
}

/// Errors raised by farm operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FarmError {
    /// Raised when the filter matches no device known to the farm.
    #[error("no device on the farm matches the filter")]
    NoMatchingDevice,
    /// Raised when matching devices exist but none became free in time.
    #[error("{matching} matching device(s) found but none became available within {waited_secs}s")]
    Capacity {
        /// Number of devices that matched the filter.
        matching: usize,
        /// Seconds spent waiting for a device to free up.
        waited_secs: u64,
    },
    /// Raised when the wait for a free device was interrupted before any
    /// device was claimed.
    #[error("interrupted while waiting for a free device")]
    Interrupted,
    /// Raised when the farm refuses an operation on a specific device.
    #[error("farm rejected {action} for device {serial}: {message}")]
    Rejected {
        /// Operation that was refused.
        action: String,
        /// Device serial the operation targeted.
        serial: String,
        /// Message reported by the farm.
        message: String,
    },
    /// Wrapper for transport and HTTP failures.
    #[error("farm API error: {message}")]
    RemoteApi {
        /// Human-readable description of the failure.
        message: String,
    },
}

impl From<reqwest::Error> for FarmError {
    fn from(value: reqwest::Error) -> Self {
        Self::RemoteApi {
            message: value.to_string(),
        }
    }
}

/// Reservation error carrying the devices claimed before the failure.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{error}")]
pub struct ReservationFailure {
    /// Cause of the failure.
    #[source]
    pub error: FarmError,
    /// Devices already reserved in this call; the caller must release them.
    pub reserved: Vec<ReservedDevice>,
}

impl From<FarmError> for ReservationFailure {
    fn from(error: FarmError) -> Self {
        Self {
            error,
            reserved: Vec::new(),
        }
    }
}

/// Minimal interface implemented by device farms.
pub trait DeviceFarm {
    /// Confirms that the endpoint answers and the token is accepted.
    fn verify<'a>(&'a self, settings: &'a FarmSettings) -> FarmFuture<'a, (), FarmError>;

    /// Lists devices matching `filter` without reserving them.
    fn list_matching<'a>(
        &'a self,
        settings: &'a FarmSettings,
        filter: &'a FilterSpec,
    ) -> FarmFuture<'a, Vec<ReservedDevice>, FarmError>;

    /// Reserves devices matching `filter` and obtains their remote endpoints.
    ///
    /// A raised `interrupt` ends the wait for a free device with
    /// [`FarmError::Interrupted`]; claims already under way are completed and
    /// returned.
    fn reserve<'a>(
        &'a self,
        settings: &'a FarmSettings,
        filter: &'a FilterSpec,
        policy: ReservationPolicy,
        interrupt: &'a Interrupt,
    ) -> FarmFuture<'a, Vec<ReservedDevice>, ReservationFailure>;

    /// Returns a device to the farm.
    fn release<'a>(
        &'a self,
        settings: &'a FarmSettings,
        device: &'a ReservedDevice,
    ) -> FarmFuture<'a, (), FarmError>;
}
