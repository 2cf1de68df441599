use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::channel::{CustomAction, ManagementChannel};
use crate::dispatcher::RequestHandler;
use crate::envelope::{Envelope, ResponseCode};
use crate::error::Result;
use crate::notifier::ChangeNotifier;
use crate::worker::WorkerPool;

/// Application code serving the custom actions of one bundle.
#[async_trait]
pub trait CustomActionHandler: Send + Sync {
    /// Run `action` with the request's `d` payload. An `Err` message is
    /// reported to the server with rc 500.
    async fn handle_action(
        &self,
        action: &CustomAction,
        data: Option<Value>,
    ) -> std::result::Result<(), String>;
}

/// Custom action handlers by bundle id.
#[derive(Default)]
pub struct CustomActions {
    bundles: DashMap<String, Arc<dyn CustomActionHandler>>,
}

impl CustomActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bundle_id: impl Into<String>, handler: Arc<dyn CustomActionHandler>) {
        self.bundles.insert(bundle_id.into(), handler);
    }

    pub fn unregister(&self, bundle_id: &str) -> bool {
        self.bundles.remove(bundle_id).is_some()
    }

    pub fn get(&self, bundle_id: &str) -> Option<Arc<dyn CustomActionHandler>> {
        self.bundles.get(bundle_id).map(|h| Arc::clone(h.value()))
    }

    pub fn bundles(&self) -> Vec<String> {
        self.bundles.iter().map(|e| e.key().clone()).collect()
    }
}

/// Routes `custom/{bundle}/{action}` requests to the registered bundle.
pub struct CustomActionRequestHandler {
    actions: Arc<CustomActions>,
    pool: Arc<WorkerPool>,
    notifier: Arc<ChangeNotifier>,
}

impl CustomActionRequestHandler {
    pub fn new(actions: Arc<CustomActions>, pool: Arc<WorkerPool>, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            actions,
            pool,
            notifier,
        }
    }
}

#[async_trait]
impl RequestHandler for CustomActionRequestHandler {
    fn channel(&self) -> ManagementChannel {
        ManagementChannel::CustomAction
    }

    async fn handle(&self, channel: &str, request: Envelope) -> Result<Option<Envelope>> {
        let Some(action) = CustomAction::parse(channel) else {
            return Ok(Some(
                Envelope::response_to(&request, ResponseCode::BadRequest)
                    .with_message(format!("malformed custom action channel '{}'", channel)),
            ));
        };
        let Some(handler) = self.actions.get(&action.bundle_id) else {
            debug!(bundle = %action.bundle_id, "no handler for custom action bundle");
            return Ok(Some(
                Envelope::response_to(&request, ResponseCode::FunctionNotImplemented)
                    .with_message(format!("unknown bundle '{}'", action.bundle_id)),
            ));
        };

        let notifier = self.notifier.clone();
        let request_id = request.request_id.clone();
        let data = request.data.clone();
        let submitted = self.pool.submit(async move {
            let result = handler.handle_action(&action, data).await;
            let mut report = json!({
                "bundleId": &action.bundle_id,
                "actionId": &action.action_id,
                "requestId": request_id,
            });
            match result {
                Ok(()) => report["rc"] = json!(ResponseCode::Success.as_u16()),
                Err(message) => {
                    warn!(bundle = %action.bundle_id, action = %action.action_id, "custom action failed: {}", message);
                    report["rc"] = json!(ResponseCode::InternalError.as_u16());
                    report["message"] = json!(message);
                }
            }
            if let Err(e) = notifier.notify(report).await {
                warn!("custom action report not delivered: {}", e);
            }
        });

        match submitted {
            Ok(()) => Ok(Some(Envelope::response_to(&request, ResponseCode::Accepted))),
            Err(e) => Ok(Some(
                Envelope::response_to(&request, ResponseCode::InternalError).with_message(e.to_string()),
            )),
        }
    }
}
