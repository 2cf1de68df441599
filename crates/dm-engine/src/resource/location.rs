//! Device location.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceValue;

/// Geographic location of the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    /// Accuracy of the position in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// When the position was measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_date_time: Option<DateTime<Utc>>,
    /// When the server last recorded the position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_date_time: Option<DateTime<Utc>>,
}

impl DeviceLocation {
    /// A position measured now.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            measured_date_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }
}

impl ResourceValue for DeviceLocation {}
