//! Per-device connection bookkeeping.

use std::fmt;

/// Debug-bridge connection state of one device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    /// No connect has been issued, or the device was disconnected.
    #[default]
    Unconnected,
    /// A connect was issued and readiness is being polled.
    Connecting,
    /// The bridge lists the device but has not been authorised to use it.
    Unauthorized,
    /// The bridge lists the device as ready.
    Connected,
    /// Polling ended without the device becoming ready.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Unauthorized => "unauthorized",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Connection record for one reserved device.
///
/// Only [`super::ConnectionBroker`] changes the state; everything else reads
/// it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceLink {
    bridge_id: String,
    pub(super) state: ConnectionState,
    pub(super) unauthorized_streak: u32,
}

impl DeviceLink {
    /// Creates an unconnected link for the device known to the bridge as
    /// `bridge_id`.
    #[must_use]
    pub fn new(bridge_id: impl Into<String>) -> Self {
        Self {
            bridge_id: bridge_id.into(),
            state: ConnectionState::Unconnected,
            unauthorized_streak: 0,
        }
    }

    /// Identifier used in bridge commands and listings.
    #[must_use]
    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }

    /// Current connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive polls that saw the device unauthorized.
    #[must_use]
    pub const fn unauthorized_streak(&self) -> u32 {
        self.unauthorized_streak
    }
}

/// One row of `adb devices` output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ListingEntry {
    /// Device identifier column.
    pub id: String,
    /// Status column (`device`, `unauthorized`, `offline`, ...).
    pub status: String,
}

/// Parses `adb devices` output into rows, skipping the header and daemon
/// notices.
#[must_use]
pub fn parse_listing(stdout: &str) -> Vec<ListingEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let id = columns.next()?;
            let status = columns.next()?;
            Some(ListingEntry {
                id: id.to_owned(),
                status: status.to_owned(),
            })
        })
        .collect()
}
