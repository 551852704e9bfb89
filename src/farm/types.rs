//! Wire types for the STF REST API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub(super) struct DeviceListResponse {
    #[serde(default)]
    pub(super) success: bool,
    #[serde(default)]
    pub(super) description: Option<String>,
    #[serde(default)]
    pub(super) devices: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub(super) struct StatusResponse {
    #[serde(default)]
    pub(super) success: bool,
    #[serde(default)]
    pub(super) description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct RemoteConnectResponse {
    #[serde(default)]
    pub(super) success: bool,
    #[serde(default)]
    pub(super) description: Option<String>,
    #[serde(rename = "remoteConnectUrl", default)]
    pub(super) remote_connect_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct AddUserDeviceRequest<'a> {
    pub(super) serial: &'a str,
}
