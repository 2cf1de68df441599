use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::channel::ManagementChannel;
use crate::dispatcher::RequestHandler;
use crate::envelope::{Envelope, ResponseCode};
use crate::error::Result;
use crate::firmware::FirmwareStateMachine;
use crate::resource::{names, FirmwareState, FirmwareUpdateStatus, ManagedResource};
use crate::worker::WorkerPool;

const URL_NOT_SET: &str = "The value of the firmware URL is not set or null";

const FIRMWARE_KEYS: [&str; 4] = ["uri", "verifier", "version", "name"];

/// Firmware fields carried by a download or update request.
///
/// Accepts `{"fields": [{"field": "mgmt.firmware", "value": {...}}]}` as
/// well as the firmware keys directly under `d`.
fn firmware_patch(request: &Envelope) -> Option<Value> {
    let data = request.data_object()?;
    if let Some(fields) = data.get("fields").and_then(Value::as_array) {
        return fields
            .iter()
            .find(|f| f.get("field").and_then(Value::as_str) == Some(names::FIRMWARE))
            .and_then(|f| f.get("value"))
            .filter(|v| v.is_object())
            .cloned();
    }
    let patch: Map<String, Value> = data
        .iter()
        .filter(|(k, _)| FIRMWARE_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (!patch.is_empty()).then_some(Value::Object(patch))
}

fn reject(request: &Envelope, rc: ResponseCode, message: impl Into<String>) -> Result<Option<Envelope>> {
    Ok(Some(Envelope::response_to(request, rc).with_message(message)))
}

/// Applies request-supplied firmware fields. Returns the error response when
/// they are unusable.
fn apply_patch(machine: &FirmwareStateMachine, request: &Envelope) -> Option<Envelope> {
    let patch = firmware_patch(request)?;
    match machine.resource().apply_remote_update(&patch) {
        Ok(()) => None,
        Err(e) => Some(
            Envelope::response_to(request, ResponseCode::BadRequest).with_message(e.to_string()),
        ),
    }
}

/// Serves firmware download requests.
pub struct FirmwareDownloadHandler {
    machine: Option<Arc<FirmwareStateMachine>>,
    pool: Arc<WorkerPool>,
}

impl FirmwareDownloadHandler {
    pub fn new(machine: Option<Arc<FirmwareStateMachine>>, pool: Arc<WorkerPool>) -> Self {
        Self { machine, pool }
    }
}

#[async_trait]
impl RequestHandler for FirmwareDownloadHandler {
    fn channel(&self) -> ManagementChannel {
        ManagementChannel::FirmwareDownload
    }

    async fn handle(&self, _channel: &str, request: Envelope) -> Result<Option<Envelope>> {
        let Some(machine) = &self.machine else {
            return reject(&request, ResponseCode::FunctionNotImplemented, "firmware actions are not supported");
        };
        if let Some(response) = apply_patch(machine, &request) {
            return Ok(Some(response));
        }
        let state = machine.state();
        if state != FirmwareState::Idle {
            return reject(
                &request,
                ResponseCode::BadRequest,
                format!("Cannot download firmware in state {:?}", state),
            );
        }
        if machine.resource().read(|fw| fw.download_url().is_none()) {
            return reject(&request, ResponseCode::BadRequest, URL_NOT_SET);
        }
        if let Err(e) = machine.begin_download() {
            return reject(&request, ResponseCode::BadRequest, e.to_string());
        }

        let job = machine.clone();
        if let Err(e) = self.pool.submit(async move {
            let status = job.run_download().await;
            info!(status = ?status, "firmware download finished");
        }) {
            warn!("could not schedule firmware download: {}", e);
            machine.abandon(FirmwareUpdateStatus::InProgress).await;
            return reject(&request, ResponseCode::InternalError, e.to_string());
        }
        Ok(Some(Envelope::response_to(&request, ResponseCode::Accepted)))
    }
}

/// Serves firmware install requests.
pub struct FirmwareUpdateHandler {
    machine: Option<Arc<FirmwareStateMachine>>,
    pool: Arc<WorkerPool>,
}

impl FirmwareUpdateHandler {
    pub fn new(machine: Option<Arc<FirmwareStateMachine>>, pool: Arc<WorkerPool>) -> Self {
        Self { machine, pool }
    }
}

#[async_trait]
impl RequestHandler for FirmwareUpdateHandler {
    fn channel(&self) -> ManagementChannel {
        ManagementChannel::FirmwareUpdate
    }

    async fn handle(&self, _channel: &str, request: Envelope) -> Result<Option<Envelope>> {
        let Some(machine) = &self.machine else {
            return reject(&request, ResponseCode::FunctionNotImplemented, "firmware actions are not supported");
        };
        if let Some(response) = apply_patch(machine, &request) {
            return Ok(Some(response));
        }
        if machine.resource().read(|fw| fw.download_url().is_none()) {
            return reject(&request, ResponseCode::BadRequest, URL_NOT_SET);
        }
        let state = machine.state();
        if state != FirmwareState::Downloaded {
            return reject(
                &request,
                ResponseCode::BadRequest,
                format!("Cannot update firmware in state {:?}", state),
            );
        }
        if let Err(e) = machine.begin_update() {
            return reject(&request, ResponseCode::BadRequest, e.to_string());
        }

        let job = machine.clone();
        if let Err(e) = self.pool.submit(async move {
            let status = job.run_update().await;
            info!(status = ?status, "firmware update finished");
        }) {
            warn!("could not schedule firmware update: {}", e);
            machine.abandon(FirmwareUpdateStatus::InProgress).await;
            return reject(&request, ResponseCode::InternalError, e.to_string());
        }
        Ok(Some(Envelope::response_to(&request, ResponseCode::Accepted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_from_fields_list() {
        let request = Envelope::request(Some(json!({
            "fields": [{"field": "mgmt.firmware", "value": {"uri": "http://x/fw.deb", "version": "2"}}]
        })));
        assert_eq!(
            firmware_patch(&request),
            Some(json!({"uri": "http://x/fw.deb", "version": "2"}))
        );
    }

    #[test]
    fn test_patch_from_flat_data() {
        let request = Envelope::request(Some(json!({"uri": "http://x/fw.deb", "other": 1})));
        assert_eq!(firmware_patch(&request), Some(json!({"uri": "http://x/fw.deb"})));
        assert_eq!(firmware_patch(&Envelope::request(Some(json!({})))), None);
        assert_eq!(firmware_patch(&Envelope::request(None)), None);
    }
}
