//! Descriptive device attributes and free-form metadata.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ResourceValue;

/// Read-mostly attributes describing the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Installed firmware version; updated after a successful install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptive_location: Option<String>,
}

impl DeviceInfo {
    pub fn with_serial_number(mut self, v: impl Into<String>) -> Self {
        self.serial_number = Some(v.into());
        self
    }

    pub fn with_manufacturer(mut self, v: impl Into<String>) -> Self {
        self.manufacturer = Some(v.into());
        self
    }

    pub fn with_model(mut self, v: impl Into<String>) -> Self {
        self.model = Some(v.into());
        self
    }

    pub fn with_fw_version(mut self, v: impl Into<String>) -> Self {
        self.fw_version = Some(v.into());
        self
    }

    pub fn with_hw_version(mut self, v: impl Into<String>) -> Self {
        self.hw_version = Some(v.into());
        self
    }
}

impl ResourceValue for DeviceInfo {}

/// Application defined key/value metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(pub Map<String, Value>);

impl Metadata {
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl ResourceValue for Metadata {
    // Metadata is replaced wholesale, the server sends the complete object.
    fn merge_remote(&mut self, patch: &Value) -> crate::error::Result<()> {
        *self = serde_json::from_value(patch.clone())?;
        Ok(())
    }
}
