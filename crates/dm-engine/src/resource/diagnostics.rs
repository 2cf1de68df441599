//! Diagnostic error codes and log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceValue;

/// Severity of a diagnostic log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LogSeverity {
    #[default]
    Informational,
    Warning,
    Error,
}

impl From<LogSeverity> for u8 {
    fn from(s: LogSeverity) -> Self {
        match s {
            LogSeverity::Informational => 0,
            LogSeverity::Warning => 1,
            LogSeverity::Error => 2,
        }
    }
}

impl TryFrom<u8> for LogSeverity {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(LogSeverity::Informational),
            1 => Ok(LogSeverity::Warning),
            2 => Ok(LogSeverity::Error),
            other => Err(format!("unknown log severity {}", other)),
        }
    }
}

/// One diagnostic log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub severity: LogSeverity,
    pub timestamp: DateTime<Utc>,
    /// Base64 encoded attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, severity: LogSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// Attach binary data, base64 encoded on the wire.
    pub fn with_data(mut self, data: &[u8]) -> Self {
        use base64::Engine;
        self.data = Some(base64::engine::general_purpose::STANDARD.encode(data));
        self
    }
}

/// Diagnostic log entries reported since the last clear.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosticLog(pub Vec<LogEntry>);

impl ResourceValue for DiagnosticLog {}

/// Error codes reported since the last clear.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCodes(pub Vec<i32>);

impl ResourceValue for ErrorCodes {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_wire_shape() {
        let entry = LogEntry::new("disk low", LogSeverity::Warning).with_data(b"abc");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["severity"], 1);
        assert_eq!(value["data"], "YWJj");
        assert!(value["timestamp"].is_string());
    }
}
