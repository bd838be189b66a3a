//! Device metadata headers.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

/// Host description reported with every request. Detected once per context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_name: String,
    pub device_model: String,
    pub platform: String,
    pub os_name: String,
    pub os_version: String,
}

impl DeviceInfo {
    pub fn detect() -> Self {
        let device_name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        let platform = if cfg!(target_os = "android") {
            "android"
        } else if cfg!(target_os = "ios") {
            "ios"
        } else {
            "desktop"
        };

        Self {
            device_name,
            device_model: std::env::consts::ARCH.to_string(),
            platform: platform.to_string(),
            os_name: sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            os_version: sysinfo::System::os_version().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Metadata attached to every request in a client context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceMetadataHeaders {
    pub device_id: String,
    pub fingerprint: String,
    pub device_name: String,
    pub device_model: String,
    pub platform: String,
    pub os_name: String,
    pub os_version: String,
    pub app_version: String,
    /// Present only with a fresh position.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl DeviceMetadataHeaders {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("x-device-id", self.device_id.clone()),
            ("x-device-fingerprint", self.fingerprint.clone()),
            ("x-device-name", self.device_name.clone()),
            ("x-device-model", self.device_model.clone()),
            ("platform", self.platform.clone()),
            ("x-os-name", self.os_name.clone()),
            ("x-os-version", self.os_version.clone()),
            ("x-app-version", self.app_version.clone()),
        ];
        if let (Some(lat), Some(lng)) = (self.latitude, self.longitude) {
            headers.push(("x-latitude", lat.to_string()));
            headers.push(("x-longitude", lng.to_string()));
        }
        headers
    }
}

/// Insert `pairs`, skipping any value that is not a legal header value.
pub(crate) fn apply(map: &mut HeaderMap, pairs: Vec<(&'static str, String)>) {
    for (name, value) in pairs {
        match HeaderValue::from_str(&value) {
            Ok(v) => {
                map.insert(HeaderName::from_static(name), v);
            }
            Err(_) => tracing::debug!(header = name, "Skipping header with invalid value"),
        }
    }
}
