use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::field_list;
use crate::channel::ManagementChannel;
use crate::device_data::DeviceData;
use crate::dispatcher::RequestHandler;
use crate::envelope::{Envelope, ResponseCode};
use crate::error::Result;
use crate::resource::ManagedResource;

/// Applies server writes to resources.
///
/// Writes go through [`ManagedResource::apply_remote_update`], so they are
/// never echoed back to the server as observation notifications.
pub struct DeviceUpdateHandler {
    device: Arc<DeviceData>,
}

impl DeviceUpdateHandler {
    pub fn new(device: Arc<DeviceData>) -> Self {
        Self { device }
    }

    /// Resolve `name` to a resource and the patch to apply to it.
    ///
    /// A name below a resource (`mgmt.firmware.uri`) addresses one key of it.
    fn resolve(&self, name: &str, value: Value) -> Option<(Arc<dyn ManagedResource>, Value)> {
        if let Some(resource) = self.device.resolve(name) {
            return Some((resource, value));
        }
        let (parent, child) = name.rsplit_once('.')?;
        let resource = self.device.resolve(parent)?;
        Some((resource, json!({ child: value })))
    }
}

#[async_trait]
impl RequestHandler for DeviceUpdateHandler {
    fn channel(&self) -> ManagementChannel {
        ManagementChannel::DeviceUpdate
    }

    async fn handle(&self, _channel: &str, request: Envelope) -> Result<Option<Envelope>> {
        let Some(fields) = field_list(&request, &["fields"]) else {
            return Ok(Some(
                Envelope::response_to(&request, ResponseCode::BadRequest)
                    .with_message("missing d.fields"),
            ));
        };

        let mut unresolved = Vec::new();
        let mut failed = Vec::new();
        for field in fields {
            if field.malformed {
                unresolved.push(field.name);
                continue;
            }
            let value = field.value.unwrap_or(Value::Null);
            match self.resolve(&field.name, value) {
                Some((resource, patch)) => match resource.apply_remote_update(&patch) {
                    Ok(()) => debug!(field = %field.name, "updated by server"),
                    Err(e) => {
                        warn!(field = %field.name, "update rejected: {}", e);
                        failed.push(field.name);
                    }
                },
                None => unresolved.push(field.name),
            }
        }

        let response = if !unresolved.is_empty() {
            Envelope::response_to(&request, ResponseCode::NotFound)
                .with_data(json!({ "fields": unresolved }))
        } else if !failed.is_empty() {
            Envelope::response_to(&request, ResponseCode::BadRequest)
                .with_message(format!("invalid value for {}", failed.join(", ")))
        } else {
            Envelope::response_to(&request, ResponseCode::UpdateSuccess)
        };
        Ok(Some(response))
    }
}
