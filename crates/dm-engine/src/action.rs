//! Device action (reboot / factory reset) lifecycle.
//!
//! ```text
//! IDLE -> ACCEPTED -> FAILED
//!      \-> UNSUPPORTED
//! ```
//!
//! A successful reboot is never reported; the endpoint restarts and
//! re-manages instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::channel::ManagementChannel;
use crate::config::ActionConfig;
use crate::envelope::ResponseCode;
use crate::error::{Error, Result};
use crate::process::{run_bounded, OutputTarget, ProcessOutcome};

/// Message used when the platform cannot perform an action.
pub const NOT_SUPPORTED_MESSAGE: &str = "Not supported at the moment";

/// Kinds of device action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Reboot,
    FactoryReset,
}

impl ActionKind {
    pub fn channel(&self) -> ManagementChannel {
        match self {
            ActionKind::Reboot => ManagementChannel::Reboot,
            ActionKind::FactoryReset => ManagementChannel::FactoryReset,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Reboot => "reboot",
            ActionKind::FactoryReset => "factory_reset",
        }
    }
}

/// Status of one device action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Idle,
    Accepted,
    Failed,
    Unsupported,
}

impl ActionStatus {
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            ActionStatus::Idle => None,
            ActionStatus::Accepted => Some(ResponseCode::Accepted),
            ActionStatus::Failed => Some(ResponseCode::InternalError),
            ActionStatus::Unsupported => Some(ResponseCode::FunctionNotImplemented),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Failed | ActionStatus::Unsupported)
    }
}

/// One in-flight reboot or factory reset.
#[derive(Debug, Clone)]
pub struct DeviceAction {
    kind: ActionKind,
    target: String,
    request_id: Option<String>,
    status: ActionStatus,
    message: Option<String>,
}

impl DeviceAction {
    pub fn new(kind: ActionKind, target: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            request_id,
            status: ActionStatus::Idle,
            message: None,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn status(&self) -> ActionStatus {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// IDLE -> ACCEPTED.
    pub fn accept(&mut self) -> Result<()> {
        self.transition(ActionStatus::Accepted, None)
    }

    /// IDLE -> UNSUPPORTED.
    pub fn reject(&mut self, message: Option<String>) -> Result<()> {
        self.transition(ActionStatus::Unsupported, message)
    }

    /// ACCEPTED -> FAILED.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(ActionStatus::Failed, Some(message.into()))
    }

    fn transition(&mut self, to: ActionStatus, message: Option<String>) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (ActionStatus::Idle, ActionStatus::Accepted)
                | (ActionStatus::Idle, ActionStatus::Unsupported)
                | (ActionStatus::Accepted, ActionStatus::Failed)
        );
        if !allowed {
            return Err(Error::InvalidState(format!(
                "{} action for {}: {:?} -> {:?}",
                self.kind.as_str(),
                self.target,
                self.status,
                to
            )));
        }
        self.status = to;
        self.message = message;
        Ok(())
    }

    /// Notification payload describing the current status.
    pub fn report(&self) -> Value {
        let mut report = json!({
            "action": self.kind.as_str(),
            "status": self.status,
        });
        if let Some(rc) = self.status.response_code() {
            report["rc"] = json!(rc.as_u16());
        }
        if let Some(message) = &self.message {
            report["message"] = json!(message);
        }
        if let Some(request_id) = &self.request_id {
            report["requestId"] = json!(request_id);
        }
        report
    }
}

/// Whether the platform can perform an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Support {
    Supported,
    Unsupported(Option<String>),
}

/// How a started action ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The procedure went through; for a reboot the process normally never
    /// gets to observe this.
    Completed,
    Failed(String),
}

/// Platform side of device actions.
#[async_trait]
pub trait DeviceActionHandler: Send + Sync {
    /// Decide synchronously whether `kind` can run.
    fn support(&self, kind: ActionKind) -> Support;

    /// Perform the action. Runs on a worker, never on the delivery path.
    async fn execute(&self, kind: ActionKind) -> ActionOutcome;
}

/// Runs configured OS commands with a bounded wait.
pub struct CommandActionHandler {
    config: ActionConfig,
}

impl CommandActionHandler {
    pub fn new(config: ActionConfig) -> Self {
        Self { config }
    }

    fn command(&self, kind: ActionKind) -> Option<&[String]> {
        let command = match kind {
            ActionKind::Reboot => Some(self.config.reboot_command.as_slice()),
            ActionKind::FactoryReset => self.config.factory_reset_command.as_deref(),
        };
        command.filter(|cmd| !cmd.is_empty())
    }
}

#[async_trait]
impl DeviceActionHandler for CommandActionHandler {
    fn support(&self, kind: ActionKind) -> Support {
        match self.command(kind) {
            Some(_) => Support::Supported,
            None => Support::Unsupported(Some(NOT_SUPPORTED_MESSAGE.to_string())),
        }
    }

    async fn execute(&self, kind: ActionKind) -> ActionOutcome {
        let Some(command) = self.command(kind) else {
            return ActionOutcome::Failed(NOT_SUPPORTED_MESSAGE.to_string());
        };
        let outcome = run_bounded(
            command,
            &[],
            OutputTarget::Capture,
            self.config.timeout(),
            self.config.poll_interval(),
        )
        .await;
        match outcome {
            ProcessOutcome::Exited { success: true, .. } => ActionOutcome::Completed,
            other => ActionOutcome::Failed(other.describe()),
        }
    }
}
