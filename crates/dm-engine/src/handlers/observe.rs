use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::field_list;
use crate::channel::ManagementChannel;
use crate::dispatcher::RequestHandler;
use crate::envelope::{Envelope, ResponseCode};
use crate::error::Result;
use crate::observation::ObservationRegistry;

/// Starts observations and answers with the current values.
pub struct ObserveHandler {
    registry: Arc<ObservationRegistry>,
}

impl ObserveHandler {
    pub fn new(registry: Arc<ObservationRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RequestHandler for ObserveHandler {
    fn channel(&self) -> ManagementChannel {
        ManagementChannel::Observe
    }

    async fn handle(&self, _channel: &str, request: Envelope) -> Result<Option<Envelope>> {
        let Some(fields) = field_list(&request, &["fields"]) else {
            return Ok(Some(
                Envelope::response_to(&request, ResponseCode::BadRequest)
                    .with_message("missing d.fields"),
            ));
        };

        let mut observed: Vec<Value> = Vec::new();
        let mut unknown: Vec<String> = Vec::new();
        for field in fields {
            if field.malformed {
                unknown.push(field.name);
                continue;
            }
            match self.registry.observe(&field.name) {
                Some(value) => observed.push(json!({ "field": field.name, "value": value })),
                None => unknown.push(field.name),
            }
        }

        let data = json!({ "fields": observed });
        if unknown.is_empty() {
            Ok(Some(
                Envelope::response_to(&request, ResponseCode::Success).with_data(data),
            ))
        } else {
            debug!(fields = ?unknown, "observe for unknown fields");
            Ok(Some(
                Envelope::response_to(&request, ResponseCode::NotFound)
                    .with_data(data)
                    .with_message(format!("unknown fields: {}", unknown.join(", "))),
            ))
        }
    }
}

/// Cancels observations.
pub struct CancelHandler {
    registry: Arc<ObservationRegistry>,
}

impl CancelHandler {
    pub fn new(registry: Arc<ObservationRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RequestHandler for CancelHandler {
    fn channel(&self) -> ManagementChannel {
        ManagementChannel::Cancel
    }

    async fn handle(&self, _channel: &str, request: Envelope) -> Result<Option<Envelope>> {
        let Some(fields) = field_list(&request, &["fields", "data"]) else {
            return Ok(Some(
                Envelope::response_to(&request, ResponseCode::BadRequest)
                    .with_message("missing d.fields"),
            ));
        };
        for field in fields.into_iter().filter(|f| !f.malformed) {
            if !self.registry.cancel(&field.name) {
                debug!(field = %field.name, "cancel for unobserved field");
            }
        }
        Ok(Some(Envelope::response_to(&request, ResponseCode::Success)))
    }
}
