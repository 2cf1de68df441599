use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::action::{
    ActionKind, ActionOutcome, DeviceAction, DeviceActionHandler, Support, NOT_SUPPORTED_MESSAGE,
};
use crate::channel::ManagementChannel;
use crate::dispatcher::RequestHandler;
use crate::envelope::{Envelope, ResponseCode};
use crate::error::Result;
use crate::notifier::ChangeNotifier;
use crate::worker::WorkerPool;

/// Serves reboot and factory reset requests.
///
/// Answers 501 when the platform cannot perform the action and 202 once it
/// was handed to the worker pool. A failure is reported later as one
/// notification; success is never reported.
pub struct DeviceActionRequestHandler {
    kind: ActionKind,
    platform: Option<Arc<dyn DeviceActionHandler>>,
    pool: Arc<WorkerPool>,
    notifier: Arc<ChangeNotifier>,
    target: String,
}

impl DeviceActionRequestHandler {
    pub fn new(
        kind: ActionKind,
        platform: Option<Arc<dyn DeviceActionHandler>>,
        pool: Arc<WorkerPool>,
        notifier: Arc<ChangeNotifier>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            platform,
            pool,
            notifier,
            target: target.into(),
        }
    }
}

#[async_trait]
impl RequestHandler for DeviceActionRequestHandler {
    fn channel(&self) -> ManagementChannel {
        self.kind.channel()
    }

    async fn handle(&self, _channel: &str, request: Envelope) -> Result<Option<Envelope>> {
        let mut action = DeviceAction::new(self.kind, &self.target, request.request_id.clone());

        let supported = match &self.platform {
            Some(platform) => match platform.support(self.kind) {
                Support::Supported => Ok(platform.clone()),
                Support::Unsupported(message) => Err(message),
            },
            None => Err(Some(NOT_SUPPORTED_MESSAGE.to_string())),
        };
        let platform = match supported {
            Ok(platform) => platform,
            Err(message) => {
                action.reject(message)?;
                info!(action = self.kind.as_str(), target = %self.target, "action not supported");
                let mut response =
                    Envelope::response_to(&request, ResponseCode::FunctionNotImplemented);
                response.message = action.message().map(str::to_string);
                return Ok(Some(response));
            }
        };

        action.accept()?;
        let notifier = self.notifier.clone();
        let kind = self.kind;
        let submitted = self.pool.submit(async move {
            match platform.execute(kind).await {
                ActionOutcome::Completed => {
                    info!(action = kind.as_str(), target = %action.target(), "action completed");
                }
                ActionOutcome::Failed(message) => {
                    warn!(action = kind.as_str(), target = %action.target(), "action failed: {}", message);
                    if action.fail(message).is_ok() {
                        if let Err(e) = notifier.notify(action.report()).await {
                            warn!(action = kind.as_str(), "failure report not delivered: {}", e);
                        }
                    }
                }
            }
        });

        match submitted {
            Ok(()) => Ok(Some(Envelope::response_to(&request, ResponseCode::Accepted))),
            Err(e) => {
                warn!(action = self.kind.as_str(), "could not schedule action: {}", e);
                Ok(Some(
                    Envelope::response_to(&request, ResponseCode::InternalError)
                        .with_message(e.to_string()),
                ))
            }
        }
    }
}
