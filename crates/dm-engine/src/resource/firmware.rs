//! Firmware resource value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{merge_json, ResourceValue};
use crate::error::Result;

/// Firmware lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FirmwareState {
    #[default]
    Idle,
    Downloading,
    Downloaded,
    Updating,
}

impl From<FirmwareState> for u8 {
    fn from(state: FirmwareState) -> Self {
        match state {
            FirmwareState::Idle => 0,
            FirmwareState::Downloading => 1,
            FirmwareState::Downloaded => 2,
            FirmwareState::Updating => 3,
        }
    }
}

impl TryFrom<u8> for FirmwareState {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(FirmwareState::Idle),
            1 => Ok(FirmwareState::Downloading),
            2 => Ok(FirmwareState::Downloaded),
            3 => Ok(FirmwareState::Updating),
            other => Err(format!("unknown firmware state {}", other)),
        }
    }
}

/// Outcome of the last firmware operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FirmwareUpdateStatus {
    #[default]
    Success,
    /// Code 1. Carried while an operation has left IDLE (a.k.a. idle reset).
    InProgress,
    OutOfMemory,
    ConnectionLost,
    VerificationFailed,
    UnsupportedImage,
    InvalidUri,
}

impl From<FirmwareUpdateStatus> for u8 {
    fn from(status: FirmwareUpdateStatus) -> Self {
        match status {
            FirmwareUpdateStatus::Success => 0,
            FirmwareUpdateStatus::InProgress => 1,
            FirmwareUpdateStatus::OutOfMemory => 2,
            FirmwareUpdateStatus::ConnectionLost => 3,
            FirmwareUpdateStatus::VerificationFailed => 4,
            FirmwareUpdateStatus::UnsupportedImage => 5,
            FirmwareUpdateStatus::InvalidUri => 6,
        }
    }
}

impl TryFrom<u8> for FirmwareUpdateStatus {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(FirmwareUpdateStatus::Success),
            1 => Ok(FirmwareUpdateStatus::InProgress),
            2 => Ok(FirmwareUpdateStatus::OutOfMemory),
            3 => Ok(FirmwareUpdateStatus::ConnectionLost),
            4 => Ok(FirmwareUpdateStatus::VerificationFailed),
            5 => Ok(FirmwareUpdateStatus::UnsupportedImage),
            6 => Ok(FirmwareUpdateStatus::InvalidUri),
            other => Err(format!("unknown firmware update status {}", other)),
        }
    }
}

/// Firmware description plus its lifecycle fields.
///
/// `state` and `update_status` belong to the firmware state machine; server
/// writes to them are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFirmware {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "uri", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Hex SHA-256 digest of the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier: Option<String>,
    #[serde(default)]
    pub state: FirmwareState,
    #[serde(default)]
    pub update_status: FirmwareUpdateStatus,
}

impl DeviceFirmware {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.verifier = Some(verifier.into());
        self
    }

    /// URL if present and non-blank.
    pub fn download_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

impl ResourceValue for DeviceFirmware {
    fn merge_remote(&mut self, patch: &Value) -> Result<()> {
        let mut patch = patch.clone();
        if let Some(obj) = patch.as_object_mut() {
            obj.remove("state");
            obj.remove("updateStatus");
        }
        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, &patch);
        *self = serde_json::from_value(current)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serializes_codes_as_integers() {
        let fw = DeviceFirmware {
            state: FirmwareState::Downloaded,
            update_status: FirmwareUpdateStatus::InvalidUri,
            ..DeviceFirmware::new("1.0").with_url("http://host/fw.bin")
        };
        assert_eq!(
            serde_json::to_value(&fw).unwrap(),
            json!({"version": "1.0", "uri": "http://host/fw.bin", "state": 2, "updateStatus": 6})
        );
    }

    #[test]
    fn test_remote_merge_ignores_lifecycle_fields() {
        let mut fw = DeviceFirmware::new("1.0");
        fw.merge_remote(&json!({"uri": "http://x/y", "state": 2, "updateStatus": 0, "version": "2.0"}))
            .unwrap();
        assert_eq!(fw.download_url(), Some("http://x/y"));
        assert_eq!(fw.version.as_deref(), Some("2.0"));
        assert_eq!(fw.state, FirmwareState::Idle);
    }

    #[test]
    fn test_blank_url_is_absent() {
        let fw = DeviceFirmware::default().with_url("  ");
        assert_eq!(fw.download_url(), None);
    }
}
