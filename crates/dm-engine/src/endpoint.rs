//! Managed endpoint: the management session of one device.
//!
//! ```text
//! manage()   -> manage request, await rc 200 -> build handlers, subscribe inbound
//! unmanage() -> unsubscribe inbound, unmanage request, tear handlers down
//! ```
//!
//! The handler table is built per session and dropped when the session
//! ends. Resources, observations and the firmware state machine live as
//! long as the endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::action::{ActionKind, DeviceActionHandler};
use crate::channel::ManagementChannel;
use crate::codec::{Codec, JsonCodec};
use crate::config::EndpointConfig;
use crate::device_data::DeviceData;
use crate::dispatcher::{Dispatcher, HandlerRegistry};
use crate::envelope::ResponseCode;
use crate::error::{Error, Result};
use crate::firmware::{CommandInstaller, FirmwareDownloader, FirmwareInstaller, FirmwareStateMachine};
use crate::handlers::{
    CancelHandler, CustomActionHandler, CustomActionRequestHandler, CustomActions,
    DeviceActionRequestHandler, DeviceUpdateHandler, FirmwareDownloadHandler,
    FirmwareUpdateHandler, GenericHandler, ObserveHandler,
};
use crate::notifier::ChangeNotifier;
use crate::observation::ObservationRegistry;
use crate::resource::{DeviceLocation, LogEntry, LogSeverity, ManagedResource};
use crate::transport::{MessageListener, Transport};
use crate::worker::WorkerPool;

/// Builder for [`ManagedEndpoint`].
pub struct ManagedEndpointBuilder {
    config: EndpointConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    device: Option<DeviceData>,
    action_handler: Option<Arc<dyn DeviceActionHandler>>,
    downloader: Option<Arc<dyn FirmwareDownloader>>,
    installer: Option<Arc<dyn FirmwareInstaller>>,
    pool: Option<Arc<WorkerPool>>,
}

impl ManagedEndpointBuilder {
    pub fn new(config: EndpointConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            codec: Arc::new(JsonCodec),
            device: None,
            action_handler: None,
            downloader: None,
            installer: None,
            pool: None,
        }
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Resources of the endpoint. Defaults to empty resources without firmware.
    pub fn device_data(mut self, device: DeviceData) -> Self {
        self.device = Some(device);
        self
    }

    /// Platform side of reboot and factory reset.
    pub fn action_handler(mut self, handler: Arc<dyn DeviceActionHandler>) -> Self {
        self.action_handler = Some(handler);
        self
    }

    pub fn firmware_downloader(mut self, downloader: Arc<dyn FirmwareDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn firmware_installer(mut self, installer: Arc<dyn FirmwareInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Run slow operations on a pool shared with other endpoints.
    pub fn worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn build(self) -> Result<ManagedEndpoint> {
        self.config.validate()?;

        let device = Arc::new(self.device.unwrap_or_else(|| {
            DeviceData::builder(&self.config.type_id, &self.config.device_id).build()
        }));
        let notifier = Arc::new(ChangeNotifier::new(
            self.transport.clone(),
            self.codec.clone(),
            self.config.qos,
            self.config.response_timeout(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(self.codec.clone(), notifier.clone()));
        let observations = ObservationRegistry::new(device.clone(), notifier.clone());

        let firmware = match device.firmware() {
            Some(resource) if self.config.supports_firmware_actions => {
                let downloader = match self.downloader {
                    Some(downloader) => Some(downloader),
                    None => default_downloader(&self.config)?,
                };
                downloader.map(|downloader| {
                    let installer: Arc<dyn FirmwareInstaller> = match self.installer {
                        Some(installer) => installer,
                        None => Arc::new(CommandInstaller::new(self.config.firmware.clone())),
                    };
                    Arc::new(
                        FirmwareStateMachine::new(
                            resource.clone(),
                            device.device_info().clone(),
                            notifier.clone(),
                            downloader,
                            installer,
                            self.config.firmware.clone(),
                        )
                        .with_observations(observations.clone()),
                    )
                })
            }
            _ => None,
        };
        if self.config.supports_firmware_actions && firmware.is_none() {
            debug!(device = %self.config.device_id, "firmware actions unavailable");
        }

        let action_handler = self
            .action_handler
            .filter(|_| self.config.supports_device_actions);

        Ok(ManagedEndpoint {
            config: self.config,
            device,
            transport: self.transport,
            notifier,
            dispatcher,
            observations,
            firmware,
            action_handler,
            custom_actions: Arc::new(CustomActions::new()),
            shared_pool: self.pool,
            session: Mutex::new(None),
            manage_lock: tokio::sync::Mutex::new(()),
        })
    }
}

#[cfg(feature = "http")]
fn default_downloader(config: &EndpointConfig) -> Result<Option<Arc<dyn FirmwareDownloader>>> {
    let downloader = crate::firmware::HttpDownloader::new(config.firmware.progress_step_bytes)?;
    Ok(Some(Arc::new(downloader)))
}

#[cfg(not(feature = "http"))]
fn default_downloader(_config: &EndpointConfig) -> Result<Option<Arc<dyn FirmwareDownloader>>> {
    Ok(None)
}

struct Session {
    pool: Arc<WorkerPool>,
    owns_pool: bool,
    lifetime: Option<Duration>,
    started: Instant,
}

/// One device taking part in the management protocol.
pub struct ManagedEndpoint {
    config: EndpointConfig,
    device: Arc<DeviceData>,
    transport: Arc<dyn Transport>,
    notifier: Arc<ChangeNotifier>,
    dispatcher: Arc<Dispatcher>,
    observations: Arc<ObservationRegistry>,
    firmware: Option<Arc<FirmwareStateMachine>>,
    action_handler: Option<Arc<dyn DeviceActionHandler>>,
    custom_actions: Arc<CustomActions>,
    shared_pool: Option<Arc<WorkerPool>>,
    session: Mutex<Option<Session>>,
    manage_lock: tokio::sync::Mutex<()>,
}

impl ManagedEndpoint {
    pub fn builder(config: EndpointConfig, transport: Arc<dyn Transport>) -> ManagedEndpointBuilder {
        ManagedEndpointBuilder::new(config, transport)
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn type_id(&self) -> &str {
        &self.config.type_id
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn device(&self) -> &Arc<DeviceData> {
        &self.device
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn observations(&self) -> &Arc<ObservationRegistry> {
        &self.observations
    }

    /// Firmware state machine, when firmware actions are available.
    pub fn firmware(&self) -> Option<&Arc<FirmwareStateMachine>> {
        self.firmware.as_ref()
    }

    /// Serve `custom/{bundle_id}/*` requests with `handler`.
    pub fn register_custom_action(
        &self,
        bundle_id: impl Into<String>,
        handler: Arc<dyn CustomActionHandler>,
    ) {
        self.custom_actions.register(bundle_id, handler);
    }

    pub fn is_managed(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Lifetime left in the current session. `None` when unmanaged or the
    /// lifetime is unbounded.
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        let session = self.session.lock();
        let session = session.as_ref()?;
        let lifetime = session.lifetime?;
        Some(lifetime.saturating_sub(session.started.elapsed()))
    }

    /// Start a management session with the configured lifetime.
    pub async fn manage(&self) -> Result<()> {
        let lifetime = (self.config.lifetime_secs > 0)
            .then(|| Duration::from_secs(self.config.lifetime_secs));
        self.manage_for(lifetime).await
    }

    /// Start, or refresh, a management session.
    ///
    /// `lifetime` is announced to the server; `None` asks for an unbounded
    /// session. After a reconnect, pass [`remaining_lifetime`](Self::remaining_lifetime).
    pub async fn manage_for(&self, lifetime: Option<Duration>) -> Result<()> {
        let _guard = self.manage_lock.lock().await;

        self.notifier.start();
        let listener: Arc<dyn MessageListener> = self.dispatcher.clone();
        self.transport
            .subscribe(ManagementChannel::Response, listener)
            .await?;

        let response = self
            .notifier
            .request_or_timeout(
                ManagementChannel::Manage,
                Some(self.manage_payload(lifetime)),
                self.config.manage_timeout(),
            )
            .await?;
        if response.rc() != Some(ResponseCode::Success) {
            let rc = response
                .response_code
                .map(|rc| rc.to_string())
                .unwrap_or_else(|| "none".into());
            let reason = response.message.unwrap_or_default();
            warn!(device = %self.config.device_id, rc = %rc, "manage request rejected: {}", reason);
            return Err(Error::Rejected(
                format!("manage rc {} {}", rc, reason).trim_end().to_string(),
            ));
        }

        {
            let mut session = self.session.lock();
            if let Some(session) = session.as_mut() {
                session.lifetime = lifetime;
                session.started = Instant::now();
                info!(device = %self.config.device_id, "management session refreshed");
                return Ok(());
            }
        }

        let (pool, owns_pool) = match &self.shared_pool {
            Some(pool) => (pool.clone(), false),
            None => (
                Arc::new(WorkerPool::new(
                    format!("dm-{}", self.config.device_id),
                    self.config.worker_pool_size,
                    self.config.worker_queue_capacity,
                )),
                true,
            ),
        };
        self.dispatcher.install(self.session_handlers(&pool));

        for channel in ManagementChannel::INBOUND {
            let listener: Arc<dyn MessageListener> = self.dispatcher.clone();
            if let Err(e) = self.transport.subscribe(channel, listener).await {
                warn!(channel = %channel, "subscribe failed: {}", e);
            }
        }

        *self.session.lock() = Some(Session {
            pool,
            owns_pool,
            lifetime,
            started: Instant::now(),
        });
        info!(device = %self.config.device_id, "managed");
        Ok(())
    }

    /// End the management session. A no-op when not managed.
    pub async fn unmanage(&self) -> Result<()> {
        let _guard = self.manage_lock.lock().await;

        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };

        for channel in ManagementChannel::INBOUND {
            if let Err(e) = self.transport.unsubscribe(channel).await {
                debug!(channel = %channel, "unsubscribe failed: {}", e);
            }
        }
        self.observations.cancel_all();

        match self
            .notifier
            .request(ManagementChannel::Unmanage, None, self.config.response_timeout())
            .await
        {
            Some(response) if response.rc() == Some(ResponseCode::Success) => {}
            Some(response) => {
                warn!(device = %self.config.device_id, rc = ?response.response_code, "unmanage rejected")
            }
            None => warn!(device = %self.config.device_id, "no response to unmanage"),
        }

        if let Err(e) = self.transport.unsubscribe(ManagementChannel::Response).await {
            debug!("unsubscribe failed: {}", e);
        }
        self.dispatcher.clear();
        if session.owns_pool {
            session.pool.shutdown();
        }
        info!(device = %self.config.device_id, "unmanaged");
        Ok(())
    }

    fn manage_payload(&self, lifetime: Option<Duration>) -> Value {
        let mut data = json!({
            "supports": {
                "deviceActions": self.config.supports_device_actions,
                "firmwareActions": self.config.supports_firmware_actions,
            },
            "deviceInfo": self.device.device_info().to_json(),
            "metadata": self.device.metadata().to_json(),
        });
        if let Some(lifetime) = lifetime {
            data["lifetime"] = json!(lifetime.as_secs());
        }
        data
    }

    fn session_handlers(&self, pool: &Arc<WorkerPool>) -> Arc<HandlerRegistry> {
        let target = format!("{}:{}", self.config.type_id, self.config.device_id);
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(DeviceUpdateHandler::new(self.device.clone())));
        registry.register(Arc::new(ObserveHandler::new(self.observations.clone())));
        registry.register(Arc::new(CancelHandler::new(self.observations.clone())));
        for kind in [ActionKind::Reboot, ActionKind::FactoryReset] {
            registry.register(Arc::new(DeviceActionRequestHandler::new(
                kind,
                self.action_handler.clone(),
                pool.clone(),
                self.notifier.clone(),
                target.clone(),
            )));
        }
        registry.register(Arc::new(FirmwareDownloadHandler::new(
            self.firmware.clone(),
            pool.clone(),
        )));
        registry.register(Arc::new(FirmwareUpdateHandler::new(
            self.firmware.clone(),
            pool.clone(),
        )));
        registry.register(Arc::new(GenericHandler));
        registry.register(Arc::new(CustomActionRequestHandler::new(
            self.custom_actions.clone(),
            pool.clone(),
            self.notifier.clone(),
        )));
        Arc::new(registry)
    }

    /// Report a new location.
    pub async fn update_location(&self, location: DeviceLocation) -> Result<Option<ResponseCode>> {
        let resource = self.device.location();
        let value = resource.apply_local_update(|current| {
            *current = location;
            current.updated_date_time = Some(chrono::Utc::now());
        });
        self.report(&**resource, ManagementChannel::UpdateLocation, Some(value))
            .await
    }

    /// Append a diagnostic error code.
    pub async fn add_error_code(&self, code: i32) -> Result<Option<ResponseCode>> {
        let resource = self.device.error_codes();
        resource.apply_local_update(|codes| codes.0.push(code));
        self.report(
            &**resource,
            ManagementChannel::AddErrorCode,
            Some(json!({ "errorCode": code })),
        )
        .await
    }

    pub async fn clear_error_codes(&self) -> Result<Option<ResponseCode>> {
        let resource = self.device.error_codes();
        resource.apply_local_update(|codes| codes.0.clear());
        self.report(&**resource, ManagementChannel::ClearErrorCodes, None)
            .await
    }

    /// Append a diagnostic log entry. `data` is sent base64 encoded.
    pub async fn add_log(
        &self,
        message: impl Into<String>,
        severity: LogSeverity,
        data: Option<&[u8]>,
    ) -> Result<Option<ResponseCode>> {
        let mut entry = LogEntry::new(message, severity);
        if let Some(data) = data {
            entry = entry.with_data(data);
        }
        let payload = serde_json::to_value(&entry)?;
        let resource = self.device.log();
        resource.apply_local_update(|log| log.0.push(entry));
        self.report(&**resource, ManagementChannel::AddLog, Some(payload))
            .await
    }

    pub async fn clear_logs(&self) -> Result<Option<ResponseCode>> {
        let resource = self.device.log();
        resource.apply_local_update(|log| log.0.clear());
        self.report(&**resource, ManagementChannel::ClearLogs, None)
            .await
    }

    /// Send a device-originated change. Resources that require a response
    /// wait for exactly one and record its code; others are fire-and-forget.
    async fn report(
        &self,
        resource: &dyn ManagedResource,
        channel: ManagementChannel,
        data: Option<Value>,
    ) -> Result<Option<ResponseCode>> {
        if !resource.response_required() {
            self.notifier.send_untracked(channel, data).await?;
            return Ok(None);
        }
        let response = self
            .notifier
            .request_or_timeout(channel, data, self.config.response_timeout())
            .await?;
        let rc = response.rc();
        resource.set_response_code(rc);
        debug!(channel = %channel, rc = ?rc, "device change acknowledged");
        Ok(rc)
    }
}
