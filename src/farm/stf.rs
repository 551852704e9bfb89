//! STF implementation of the device farm over its REST API.

use std::time::Duration;

use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use url::Url;

use super::device::is_available;
use super::types::{
    AddUserDeviceRequest, DeviceListResponse, RemoteConnectResponse, StatusResponse,
};
use super::{
    DeviceFarm, FarmError, FarmFuture, FarmSettings, ReservationFailure, ReservationPolicy,
    ReservedDevice,
};
use crate::broker::Interrupt;
use crate::filter::FilterSpec;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Stateless client for the STF device farm.
///
/// Holds one HTTP client per TLS mode; the endpoint and token always come
/// from the [`FarmSettings`] passed to each call.
#[derive(Clone, Debug)]
pub struct StfClient {
    strict: Client,
    insecure: Client,
    poll_interval: Duration,
}

impl StfClient {
    /// Builds the HTTP clients.
    ///
    /// # Errors
    ///
    /// Returns [`FarmError::RemoteApi`] when the TLS backend cannot be
    /// initialised.
    pub fn new() -> Result<Self, FarmError> {
        let strict = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let insecure = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            strict,
            insecure,
            poll_interval: AVAILABILITY_POLL_INTERVAL,
        })
    }

    /// Overrides how often availability is re-checked while waiting for a
    /// busy device.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    const fn http(&self, settings: &FarmSettings) -> &Client {
        if settings.insecure_tls() {
            &self.insecure
        } else {
            &self.strict
        }
    }

    fn url(settings: &FarmSettings, path: &str) -> Result<Url, FarmError> {
        settings
            .endpoint()
            .join(path)
            .map_err(|err| FarmError::RemoteApi {
                message: format!("cannot build URL for {path}: {err}"),
            })
    }

    async fn send(
        &self,
        settings: &FarmSettings,
        method: Method,
        path: &str,
        body: Option<&AddUserDeviceRequest<'_>>,
    ) -> Result<Response, FarmError> {
        let url = Self::url(settings, path)?;
        debug!(%method, %url, "farm request");
        let mut builder = self
            .http(settings)
            .request(method.clone(), url.clone())
            .bearer_auth(settings.token());
        if let Some(payload) = body {
            builder = builder.json(payload);
        }
        let response = builder.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Err(FarmError::RemoteApi {
            message: format!("{method} {url} returned {status}: {}", text.trim()),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        settings: &FarmSettings,
        method: Method,
        path: &str,
        body: Option<&AddUserDeviceRequest<'_>>,
    ) -> Result<T, FarmError> {
        let response = self.send(settings, method, path, body).await?;
        response.json::<T>().await.map_err(FarmError::from)
    }

    async fn fetch_devices(&self, settings: &FarmSettings) -> Result<Vec<Value>, FarmError> {
        let listing: DeviceListResponse = self
            .send_json(settings, Method::GET, "devices", None)
            .await?;
        if !listing.success {
            return Err(FarmError::RemoteApi {
                message: listing
                    .description
                    .unwrap_or_else(|| String::from("device listing was not successful")),
            });
        }
        Ok(listing.devices)
    }

    async fn add_user_device(
        &self,
        settings: &FarmSettings,
        serial: &str,
    ) -> Result<(), FarmError> {
        let status: StatusResponse = self
            .send_json(
                settings,
                Method::POST,
                "user/devices",
                Some(&AddUserDeviceRequest { serial }),
            )
            .await?;
        if status.success {
            return Ok(());
        }
        Err(FarmError::Rejected {
            action: String::from("reservation"),
            serial: serial.to_owned(),
            message: status.description.unwrap_or_default(),
        })
    }

    async fn remote_connect(
        &self,
        settings: &FarmSettings,
        serial: &str,
    ) -> Result<String, FarmError> {
        let path = format!("user/devices/{serial}/remoteConnect");
        let connect: RemoteConnectResponse =
            self.send_json(settings, Method::POST, &path, None).await?;
        match connect.remote_connect_url {
            Some(url) if connect.success && !url.trim().is_empty() => Ok(url.trim().to_owned()),
            _ => Err(FarmError::Rejected {
                action: String::from("remote connect"),
                serial: serial.to_owned(),
                message: connect
                    .description
                    .unwrap_or_else(|| String::from("no remote connect URL returned")),
            }),
        }
    }

    async fn revoke_remote_connect(
        &self,
        settings: &FarmSettings,
        serial: &str,
    ) -> Result<(), FarmError> {
        let path = format!("user/devices/{serial}/remoteConnect");
        self.send(settings, Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn remove_user_device(
        &self,
        settings: &FarmSettings,
        serial: &str,
    ) -> Result<(), FarmError> {
        let path = format!("user/devices/{serial}");
        let status: StatusResponse = self
            .send_json(settings, Method::DELETE, &path, None)
            .await?;
        if status.success {
            return Ok(());
        }
        Err(FarmError::Rejected {
            action: String::from("release"),
            serial: serial.to_owned(),
            message: status.description.unwrap_or_default(),
        })
    }

    /// Polls the farm until at least one matching device is free.
    async fn wait_for_available(
        &self,
        settings: &FarmSettings,
        filter: &FilterSpec,
        wait: Duration,
        interrupt: &Interrupt,
    ) -> Result<Vec<Value>, FarmError> {
        let started = Instant::now();
        let deadline = started + wait;
        loop {
            if interrupt.is_raised() {
                return Err(FarmError::Interrupted);
            }
            let matching: Vec<Value> = self
                .fetch_devices(settings)
                .await?
                .into_iter()
                .filter(|record| filter.matches(record))
                .collect();
            if matching.is_empty() {
                return Err(FarmError::NoMatchingDevice);
            }

            let matching_count = matching.len();
            let available: Vec<Value> = matching.into_iter().filter(is_available).collect();
            if !available.is_empty() {
                return Ok(available);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(FarmError::Capacity {
                    matching: matching_count,
                    waited_secs: now.duration_since(started).as_secs(),
                });
            }
            info!(
                matching = matching_count,
                "all matching devices are in use; waiting for one to be released"
            );
            tokio::select! {
                () = sleep(self.poll_interval.min(deadline - now)) => {}
                () = interrupt.raised() => return Err(FarmError::Interrupted),
            }
        }
    }

    async fn reserve_devices(
        &self,
        settings: &FarmSettings,
        filter: &FilterSpec,
        policy: ReservationPolicy,
        interrupt: &Interrupt,
    ) -> Result<Vec<ReservedDevice>, ReservationFailure> {
        let available = self
            .wait_for_available(settings, filter, policy.wait, interrupt)
            .await?;
        let take = if policy.all_matching { available.len() } else { 1 };

        let mut reserved = Vec::with_capacity(take);
        for record in available.iter().take(take) {
            let Some(serial) = record.get("serial").and_then(Value::as_str) else {
                warn!("skipping farm record without a serial");
                continue;
            };

            if let Err(error) = self.add_user_device(settings, serial).await {
                return Err(ReservationFailure { error, reserved });
            }

            match self.remote_connect(settings, serial).await {
                Ok(url) => {
                    if let Some(device) = ReservedDevice::from_record(record, Some(&url)) {
                        reserved.push(device);
                    }
                }
                Err(error) => {
                    // Claimed on the farm without an endpoint; still ours to release.
                    if let Some(device) = ReservedDevice::from_record(record, Some("")) {
                        reserved.push(device);
                    }
                    return Err(ReservationFailure { error, reserved });
                }
            }
        }

        if reserved.is_empty() {
            return Err(FarmError::NoMatchingDevice.into());
        }
        Ok(reserved)
    }
}

impl DeviceFarm for StfClient {
    fn verify<'a>(&'a self, settings: &'a FarmSettings) -> FarmFuture<'a, (), FarmError> {
        Box::pin(async move {
            let status: StatusResponse = self
                .send_json(settings, Method::GET, "user", None)
                .await?;
            if status.success {
                Ok(())
            } else {
                Err(FarmError::RemoteApi {
                    message: status
                        .description
                        .unwrap_or_else(|| String::from("farm rejected the access token")),
                })
            }
        })
    }

    fn list_matching<'a>(
        &'a self,
        settings: &'a FarmSettings,
        filter: &'a FilterSpec,
    ) -> FarmFuture<'a, Vec<ReservedDevice>, FarmError> {
        Box::pin(async move {
            Ok(self
                .fetch_devices(settings)
                .await?
                .iter()
                .filter(|record| filter.matches(record))
                .filter_map(|record| ReservedDevice::from_record(record, None))
                .collect())
        })
    }

    fn reserve<'a>(
        &'a self,
        settings: &'a FarmSettings,
        filter: &'a FilterSpec,
        policy: ReservationPolicy,
        interrupt: &'a Interrupt,
    ) -> FarmFuture<'a, Vec<ReservedDevice>, ReservationFailure> {
        Box::pin(self.reserve_devices(settings, filter, policy, interrupt))
    }

    fn release<'a>(
        &'a self,
        settings: &'a FarmSettings,
        device: &'a ReservedDevice,
    ) -> FarmFuture<'a, (), FarmError> {
        Box::pin(async move {
            if !device.connect_url.is_empty()
                && let Err(err) = self.revoke_remote_connect(settings, &device.serial).await
            {
                warn!(serial = %device.serial, error = %err, "failed to revoke remote connect");
            }
            self.remove_user_device(settings, &device.serial).await
        })
    }
}
