//! Reserved device records and their human-facing summaries.

use serde_json::{Map, Value};
use url::Url;

const ICON_PATH: &str = "/static/app/devices/icon/x120/";
const DEFAULT_ICON: &str = "_default.jpg";

/// A device leased from the farm for the duration of one job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReservedDevice {
    /// Farm serial of the device.
    pub serial: String,
    /// Remote debug endpoint (`host:port`) assigned by the farm.
    pub connect_url: String,
    /// Display name (marketing name or model).
    pub name: String,
    /// SDK level reported by the farm.
    pub sdk: Option<String>,
    /// OS version reported by the farm.
    pub version: Option<String>,
    /// Icon image name used by the farm UI.
    pub image: Option<String>,
    /// Remaining farm-assigned metadata.
    pub attributes: Map<String, Value>,
}

impl ReservedDevice {
    /// Builds a device from a farm record and the remote endpoint.
    ///
    /// Returns `None` when the record has no serial.
    #[must_use]
    pub fn from_record(record: &Value, connect_url: Option<&str>) -> Option<Self> {
        let serial = text_field(record, "serial")?;
        let name = text_field(record, "name")
            .filter(|name| !name.is_empty())
            .or_else(|| text_field(record, "model"))
            .unwrap_or_else(|| serial.clone());
        let connect_url = connect_url
            .map(str::to_owned)
            .or_else(|| text_field(record, "remoteConnectUrl"))
            .unwrap_or_default();
        Some(Self {
            connect_url,
            name,
            sdk: text_field(record, "sdk"),
            version: text_field(record, "version"),
            image: text_field(record, "image"),
            attributes: record.as_object().cloned().unwrap_or_default(),
            serial,
        })
    }

    /// Identifier used on the debug bridge: the remote endpoint when known,
    /// otherwise the serial.
    #[must_use]
    pub fn bridge_id(&self) -> &str {
        if self.connect_url.is_empty() {
            &self.serial
        } else {
            &self.connect_url
        }
    }

    /// One-line description for logs and previews.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} (serial {}, SDK {}, version {})",
            self.name,
            self.serial,
            self.sdk.as_deref().unwrap_or("unknown"),
            self.version.as_deref().unwrap_or("unknown")
        )
    }

    /// Absolute URL of the device's icon on the farm.
    #[must_use]
    pub fn icon_url(&self, endpoint: &Url) -> Option<Url> {
        let image = self
            .image
            .as_deref()
            .filter(|image| !image.is_empty())
            .unwrap_or(DEFAULT_ICON);
        endpoint.join(&format!("{ICON_PATH}{image}")).ok()
    }
}

/// Returns `true` when the farm reports the device free for reservation.
pub(crate) fn is_available(record: &Value) -> bool {
    let flag = |key: &str| record.get(key).and_then(Value::as_bool).unwrap_or(false);
    let unowned = record.get("owner").is_none_or(Value::is_null);
    flag("present") && flag("ready") && unowned
}

fn text_field(record: &Value, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
