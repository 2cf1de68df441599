//! Device management protocol engine.
//!
//! Lets a managed endpoint (a device or a gateway) take part in a
//! cloud-driven management lifecycle over a topic-addressed publish/subscribe
//! transport:
//!
//! - inbound requests are dispatched per [`ManagementChannel`] to handlers
//!   that answer with a correlated [`Envelope`];
//! - resources are typed, observable attributes; server observations turn
//!   local changes into diffed notifications;
//! - reboot and factory reset run through a [`DeviceAction`] lifecycle,
//!   firmware through the [`FirmwareStateMachine`], both on a worker pool
//!   so that the delivery path never blocks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dm_engine::{EndpointConfig, ManagedEndpoint, MemoryTransport};
//!
//! # async fn run() -> dm_engine::Result<()> {
//! let transport = Arc::new(MemoryTransport::new());
//! let endpoint = ManagedEndpoint::builder(EndpointConfig::new("sensor", "d1"), transport).build()?;
//! endpoint.manage().await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod channel;
pub mod codec;
pub mod config;
pub mod device_data;
pub mod dispatcher;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod firmware;
pub mod gateway;
pub mod handlers;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod notifier;
pub mod observation;
pub mod process;
pub mod resource;
pub mod transport;
pub mod worker;

pub use action::{
    ActionKind, ActionOutcome, ActionStatus, CommandActionHandler, DeviceAction,
    DeviceActionHandler, Support,
};
pub use channel::{CustomAction, ManagementChannel};
pub use codec::{Codec, JsonCodec};
pub use config::{ActionConfig, EndpointConfig, FirmwareConfig};
pub use device_data::{DeviceData, DeviceDataBuilder};
pub use dispatcher::{Dispatcher, HandlerRegistry, RequestHandler};
pub use endpoint::{ManagedEndpoint, ManagedEndpointBuilder};
pub use envelope::{Envelope, ResponseCode};
pub use error::{Error, Result};
pub use firmware::{FirmwareDownloader, FirmwareInstaller, FirmwareStateMachine};
pub use gateway::ManagedGateway;
pub use handlers::CustomActionHandler;
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttTransport, MqttTransportConfig, TopicScheme};
pub use notifier::ChangeNotifier;
pub use observation::ObservationRegistry;
pub use resource::{
    DeviceFirmware, DeviceInfo, DeviceLocation, FirmwareState, FirmwareUpdateStatus, LogSeverity,
    ManagedResource, Resource,
};
pub use transport::{MemoryTransport, MessageListener, Transport};
pub use worker::WorkerPool;
