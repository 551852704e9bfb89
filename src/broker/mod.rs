//! Debug-bridge connection handshake for reserved devices.
//!
//! The broker issues `connect` for each device, then polls `adb devices` until
//! one of them is listed as ready, the time budget runs out, or the session is
//! interrupted. Poll spacing adapts to the budget so long waits do not hammer
//! the bridge and short ones do not miss the window.

mod interrupt;
mod types;

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::bridge::{COMMAND_TIMEOUT, CommandRunner, DebugBridge};

pub use interrupt::Interrupt;
pub use types::{ConnectionState, DeviceLink, ListingEntry, parse_listing};

/// Consecutive unauthorized sightings that trigger the one-off warning.
pub const UNAUTHORIZED_WARNING_THRESHOLD: u32 = 4;

/// Shortest time a device listing is given, even at the deadline.
pub const MIN_LISTING_TIMEOUT: Duration = Duration::from_millis(500);

/// Time cap for a listing issued with `remaining` budget left.
///
/// A hung listing may overrun the deadline by at most one poll interval.
#[must_use]
pub fn listing_timeout(remaining: Duration, interval: Duration) -> Duration {
    remaining
        .saturating_add(interval)
        .clamp(MIN_LISTING_TIMEOUT, COMMAND_TIMEOUT)
}

/// Returns the poll spacing for a total budget: `T / (2 * sqrt(T / 1000))`
/// with `T` in milliseconds.
#[must_use]
#[expect(
    clippy::float_arithmetic,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "interval is a square-root heuristic truncated to whole milliseconds"
)]
pub fn poll_interval(total: Duration) -> Duration {
    if total.is_zero() {
        return Duration::ZERO;
    }
    let total_ms = total.as_millis() as f64;
    let interval_ms = total_ms / (2.0 * (total_ms / 1000.0).sqrt());
    Duration::from_millis(interval_ms as u64)
}

/// Drives connect, readiness polling and disconnect through the bridge.
#[derive(Clone, Debug)]
pub struct ConnectionBroker<R: CommandRunner> {
    bridge: DebugBridge<R>,
    interrupt: Interrupt,
}

impl<R: CommandRunner> ConnectionBroker<R> {
    /// Creates a broker over `bridge` that stops polling when `interrupt` is
    /// raised.
    #[must_use]
    pub const fn new(bridge: DebugBridge<R>, interrupt: Interrupt) -> Self {
        Self { bridge, interrupt }
    }

    /// Interrupt observed by the readiness wait.
    #[must_use]
    pub const fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Bridge used for every command.
    #[must_use]
    pub const fn bridge(&self) -> &DebugBridge<R> {
        &self.bridge
    }

    /// Starts the bridge server. Issued twice: the first start after boot
    /// often returns before the server accepts connections.
    pub fn start_server(&self) {
        for attempt in 1..=2 {
            match self.bridge.start_server() {
                Ok(output) if output.is_success() => {
                    debug!(attempt, port = self.bridge.port(), "bridge server started");
                }
                Ok(output) => {
                    warn!(
                        attempt,
                        status = %output.status_text(),
                        stderr = %output.stderr.trim(),
                        "bridge start-server reported failure"
                    );
                }
                Err(err) => warn!(attempt, error = %err, "bridge start-server failed"),
            }
        }
        info!(port = self.bridge.port(), "bridge server running");
    }

    /// Stops the bridge server. Failures are logged and returned as text.
    #[must_use]
    pub fn kill_server(&self) -> Option<String> {
        match self.bridge.kill_server() {
            Ok(output) if output.is_success() => None,
            Ok(output) => Some(format!(
                "kill-server exited with status {}: {}",
                output.status_text(),
                output.stderr.trim()
            )),
            Err(err) => Some(err.to_string()),
        }
    }

    /// Issues `connect` for `link` and marks it connecting whatever the
    /// command reports; readiness is decided by polling.
    pub fn connect(&self, link: &mut DeviceLink) {
        match self.bridge.connect(link.bridge_id()) {
            Ok(output) if output.is_success() => {
                debug!(device = link.bridge_id(), stdout = %output.stdout.trim(), "connect issued");
            }
            Ok(output) => warn!(
                device = link.bridge_id(),
                status = %output.status_text(),
                "connect reported failure; polling anyway"
            ),
            Err(err) => warn!(
                device = link.bridge_id(),
                error = %err,
                "connect failed; polling anyway"
            ),
        }
        link.state = ConnectionState::Connecting;
        link.unauthorized_streak = 0;
    }

    /// Issues `disconnect` for `link`. Failures are logged and returned as
    /// text; the link is unconnected afterwards either way.
    pub fn disconnect(&self, link: &mut DeviceLink) -> Option<String> {
        let fault = match self.bridge.disconnect(link.bridge_id()) {
            Ok(output) if output.is_success() => None,
            Ok(output) => Some(format!(
                "disconnect exited with status {}: {}",
                output.status_text(),
                output.stderr.trim()
            )),
            Err(err) => Some(err.to_string()),
        };
        if let Some(message) = &fault {
            warn!(device = link.bridge_id(), error = %message, "disconnect failed");
        }
        link.state = ConnectionState::Unconnected;
        link.unauthorized_streak = 0;
        fault
    }

    /// Polls the bridge until any link is listed ready.
    ///
    /// Returns `true` as soon as one device is ready, even when others are
    /// still pending. Returns `false` when `total` elapses or the interrupt is
    /// raised; links that never became ready are marked failed. At most one
    /// unauthorized warning is logged per wait, however many devices stay
    /// unauthorized.
    pub async fn await_ready<'l>(
        &self,
        links: impl IntoIterator<Item = &'l mut DeviceLink>,
        total: Duration,
    ) -> bool {
        let mut links: Vec<&mut DeviceLink> = links.into_iter().collect();
        let interval = poll_interval(total);
        let deadline = Instant::now() + total;
        let mut warned = false;
        info!(
            devices = links.len(),
            timeout_ms = total.as_millis(),
            interval_ms = interval.as_millis(),
            "waiting for devices to come online"
        );

        loop {
            if self.interrupt.is_raised() {
                info!("interrupted while waiting for devices");
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout = listing_timeout(remaining, interval);
            if self.poll_once(&mut links, timeout, &mut warned) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                info!("timed out waiting for devices");
                break;
            }
            tokio::select! {
                () = sleep(interval.min(deadline - now)) => {}
                () = self.interrupt.raised() => {
                    info!("interrupted while waiting for devices");
                    break;
                }
            }
        }

        for link in links {
            if link.state != ConnectionState::Connected {
                link.state = ConnectionState::Failed;
            }
        }
        false
    }

    /// Resets every link to unconnected.
    pub fn reset<'l>(&self, links: impl IntoIterator<Item = &'l mut DeviceLink>) {
        for link in links {
            link.state = ConnectionState::Unconnected;
            link.unauthorized_streak = 0;
        }
    }

    fn poll_once(
        &self,
        links: &mut [&mut DeviceLink],
        timeout: Duration,
        warned: &mut bool,
    ) -> bool {
        let listing = match self.bridge.devices(timeout) {
            Ok(output) => parse_listing(&output.stdout),
            Err(err) => {
                warn!(error = %err, "device listing failed");
                Vec::new()
            }
        };
        debug!(?listing, "device listing");

        let mut ready = false;
        for link in links.iter_mut() {
            let status = listing
                .iter()
                .find(|entry| entry.id == link.bridge_id())
                .map(|entry| entry.status.as_str());
            match status {
                Some("device") => {
                    link.state = ConnectionState::Connected;
                    link.unauthorized_streak = 0;
                    ready = true;
                }
                Some("unauthorized") => {
                    observe_unauthorized(link, warned);
                }
                _ => link.unauthorized_streak = 0,
            }
            if ready {
                break;
            }
        }
        ready
    }
}

/// Records an unauthorized sighting. Returns `true` when this sighting
/// logged the warning.
fn observe_unauthorized(link: &mut DeviceLink, warned: &mut bool) -> bool {
    link.state = ConnectionState::Unauthorized;
    link.unauthorized_streak = link.unauthorized_streak.saturating_add(1);
    if link.unauthorized_streak < UNAUTHORIZED_WARNING_THRESHOLD || *warned {
        return false;
    }
    *warned = true;
    warn!(
        device = link.bridge_id(),
        "device is still unauthorized; check that the farm's adb key is accepted on the device"
    );
    true
}
