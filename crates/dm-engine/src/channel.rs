//! Management channel identifiers.
//!
//! A channel names one category of management traffic. The identifiers are
//! process-wide constants; mapping them onto concrete transport topics is
//! the transport adapter's job.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Prefix of custom action channel names (`custom/{bundle}/{action}`).
pub const CUSTOM_PREFIX: &str = "custom";

/// Which way traffic flows on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Server to device.
    Inbound,
    /// Device to server.
    Outbound,
    /// Used in both directions (responses).
    Bidirectional,
}

/// Enumerated management channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManagementChannel {
    /// Server writes resource values.
    DeviceUpdate,
    /// Server subscribes to resource changes.
    Observe,
    /// Server cancels a subscription.
    Cancel,
    /// Reboot request.
    Reboot,
    /// Factory reset request.
    FactoryReset,
    /// Firmware download request.
    FirmwareDownload,
    /// Firmware install request.
    FirmwareUpdate,
    /// Catch-all server request.
    Generic,
    /// Custom action request; the concrete name carries bundle and action ids.
    CustomAction,
    /// Correlated responses, both directions.
    Response,
    /// Change notifications.
    Notify,
    /// Begin a management session.
    Manage,
    /// End a management session.
    Unmanage,
    /// Device reports its location.
    UpdateLocation,
    /// Device appends a diagnostic error code.
    AddErrorCode,
    /// Device clears diagnostic error codes.
    ClearErrorCodes,
    /// Device appends a diagnostic log entry.
    AddLog,
    /// Device clears diagnostic log entries.
    ClearLogs,
}

impl ManagementChannel {
    /// Channels the engine listens on while a session is active.
    pub const INBOUND: [ManagementChannel; 9] = [
        ManagementChannel::DeviceUpdate,
        ManagementChannel::Observe,
        ManagementChannel::Cancel,
        ManagementChannel::Reboot,
        ManagementChannel::FactoryReset,
        ManagementChannel::FirmwareDownload,
        ManagementChannel::FirmwareUpdate,
        ManagementChannel::Generic,
        ManagementChannel::CustomAction,
    ];

    /// Channel identifier string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagementChannel::DeviceUpdate => "device-update",
            ManagementChannel::Observe => "observe",
            ManagementChannel::Cancel => "cancel",
            ManagementChannel::Reboot => "reboot",
            ManagementChannel::FactoryReset => "factory-reset",
            ManagementChannel::FirmwareDownload => "firmware-download",
            ManagementChannel::FirmwareUpdate => "firmware-update",
            ManagementChannel::Generic => "generic",
            ManagementChannel::CustomAction => CUSTOM_PREFIX,
            ManagementChannel::Response => "response",
            ManagementChannel::Notify => "notify",
            ManagementChannel::Manage => "manage",
            ManagementChannel::Unmanage => "unmanage",
            ManagementChannel::UpdateLocation => "update-location",
            ManagementChannel::AddErrorCode => "add-error-code",
            ManagementChannel::ClearErrorCodes => "clear-error-codes",
            ManagementChannel::AddLog => "add-log",
            ManagementChannel::ClearLogs => "clear-logs",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            ManagementChannel::Response => Direction::Bidirectional,
            ManagementChannel::Notify
            | ManagementChannel::Manage
            | ManagementChannel::Unmanage
            | ManagementChannel::UpdateLocation
            | ManagementChannel::AddErrorCode
            | ManagementChannel::ClearErrorCodes
            | ManagementChannel::AddLog
            | ManagementChannel::ClearLogs => Direction::Outbound,
            _ => Direction::Inbound,
        }
    }

    /// Resolve a channel name, including `custom/{bundle}/{action}` forms.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(rest) = name.strip_prefix(CUSTOM_PREFIX) {
            return if rest.is_empty() || CustomAction::parse(name).is_some() {
                Some(ManagementChannel::CustomAction)
            } else {
                None
            };
        }
        ManagementChannel::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == name)
    }

    fn all() -> &'static [ManagementChannel] {
        &[
            ManagementChannel::DeviceUpdate,
            ManagementChannel::Observe,
            ManagementChannel::Cancel,
            ManagementChannel::Reboot,
            ManagementChannel::FactoryReset,
            ManagementChannel::FirmwareDownload,
            ManagementChannel::FirmwareUpdate,
            ManagementChannel::Generic,
            ManagementChannel::CustomAction,
            ManagementChannel::Response,
            ManagementChannel::Notify,
            ManagementChannel::Manage,
            ManagementChannel::Unmanage,
            ManagementChannel::UpdateLocation,
            ManagementChannel::AddErrorCode,
            ManagementChannel::ClearErrorCodes,
            ManagementChannel::AddLog,
            ManagementChannel::ClearLogs,
        ]
    }
}

impl fmt::Display for ManagementChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagementChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ManagementChannel::parse(s).ok_or_else(|| Error::NotFound(format!("channel '{}'", s)))
    }
}

/// Bundle and action ids addressed by a custom action channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomAction {
    pub bundle_id: String,
    pub action_id: String,
}

impl CustomAction {
    pub fn new(bundle_id: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            action_id: action_id.into(),
        }
    }

    /// Parse `custom/{bundle}/{action}`.
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.splitn(3, '/');
        if parts.next()? != CUSTOM_PREFIX {
            return None;
        }
        let bundle = parts.next().filter(|s| !s.is_empty())?;
        let action = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
        Some(Self::new(bundle, action))
    }

    /// Channel name for this action.
    pub fn channel_name(&self) -> String {
        format!("{}/{}/{}", CUSTOM_PREFIX, self.bundle_id, self.action_id)
    }
}
