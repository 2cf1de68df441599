//! MQTT transport adapter.
//!
//! Maps management channels onto the `iotdm-1/...` (server to device) and
//! `iotdevice-1/...` (device to server) topic trees. Gateways address their
//! attached devices with a `type/{type}/id/{id}` infix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{CustomAction, ManagementChannel};
use crate::error::{Error, Result};
use crate::transport::{MessageListener, Transport};

const SERVER_ROOT: &str = "iotdm-1";
const DEVICE_ROOT: &str = "iotdevice-1";
const CUSTOM_SUFFIX: &str = "mgmt/custom";

/// How channel names become topics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopicScheme {
    /// A directly connected device.
    #[default]
    Device,
    /// A device reached through a gateway connection.
    Gateway { type_id: String, device_id: String },
}

impl TopicScheme {
    fn prefix(&self, root: &str) -> String {
        match self {
            TopicScheme::Device => root.to_string(),
            TopicScheme::Gateway { type_id, device_id } => {
                format!("{}/type/{}/id/{}", root, type_id, device_id)
            }
        }
    }

    fn inbound_suffix(channel: ManagementChannel) -> Option<&'static str> {
        match channel {
            ManagementChannel::Response => Some("response"),
            ManagementChannel::Observe => Some("observe"),
            ManagementChannel::Cancel => Some("cancel"),
            ManagementChannel::DeviceUpdate => Some("device/update"),
            ManagementChannel::Reboot => Some("mgmt/initiate/device/reboot"),
            ManagementChannel::FactoryReset => Some("mgmt/initiate/device/factory_reset"),
            ManagementChannel::FirmwareDownload => Some("mgmt/initiate/firmware/download"),
            ManagementChannel::FirmwareUpdate => Some("mgmt/initiate/firmware/update"),
            ManagementChannel::Generic => Some("#"),
            ManagementChannel::CustomAction => Some("mgmt/custom/+/+"),
            _ => None,
        }
    }

    fn outbound_suffix(channel: ManagementChannel) -> Option<&'static str> {
        match channel {
            ManagementChannel::Response => Some("response"),
            ManagementChannel::Notify => Some("notify"),
            ManagementChannel::Manage => Some("mgmt/manage"),
            ManagementChannel::Unmanage => Some("mgmt/unmanage"),
            ManagementChannel::UpdateLocation => Some("device/update/location"),
            ManagementChannel::AddErrorCode => Some("add/diag/errorCodes"),
            ManagementChannel::ClearErrorCodes => Some("clear/diag/errorCodes"),
            ManagementChannel::AddLog => Some("add/diag/log"),
            ManagementChannel::ClearLogs => Some("clear/diag/log"),
            _ => None,
        }
    }

    /// Topic the device publishes `channel` traffic on.
    pub fn publish_topic(&self, channel: ManagementChannel) -> Option<String> {
        Self::outbound_suffix(channel).map(|s| format!("{}/{}", self.prefix(DEVICE_ROOT), s))
    }

    /// Topic filter the device subscribes to for `channel`.
    pub fn subscribe_filter(&self, channel: ManagementChannel) -> Option<String> {
        Self::inbound_suffix(channel).map(|s| format!("{}/{}", self.prefix(SERVER_ROOT), s))
    }

    /// Channel name for an inbound topic.
    ///
    /// Topics under the server root that match no specific channel fall
    /// through to `generic`.
    pub fn route(&self, topic: &str) -> Option<String> {
        let prefix = self.prefix(SERVER_ROOT);
        let suffix = topic.strip_prefix(&prefix)?.strip_prefix('/')?;

        if let Some(rest) = suffix.strip_prefix(CUSTOM_SUFFIX) {
            let name = format!("custom{}", rest);
            if let Some(action) = CustomAction::parse(&name) {
                return Some(action.channel_name());
            }
        }

        let specific = ManagementChannel::INBOUND
            .iter()
            .chain(std::iter::once(&ManagementChannel::Response))
            .filter(|c| !matches!(c, ManagementChannel::Generic | ManagementChannel::CustomAction))
            .find(|c| Self::inbound_suffix(**c) == Some(suffix));
        Some(
            specific
                .map(|c| c.as_str())
                .unwrap_or(ManagementChannel::Generic.as_str())
                .to_string(),
        )
    }
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    60
}

/// MQTT connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttTransportConfig {
    /// Broker host name.
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client identifier; generated when empty.
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default)]
    pub scheme: TopicScheme,
}

impl MqttTransportConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            scheme: TopicScheme::Device,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_scheme(mut self, scheme: TopicScheme) -> Self {
        self.scheme = scheme;
        self
    }
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

type Listeners = Arc<DashMap<ManagementChannel, Arc<dyn MessageListener>>>;

type Inbound = (String, Vec<u8>);

/// One delivery task per channel: messages on a channel arrive in order,
/// while a slow listener never holds up other channels.
struct DeliveryLanes {
    listeners: Listeners,
    lanes: HashMap<ManagementChannel, mpsc::UnboundedSender<Inbound>>,
}

impl DeliveryLanes {
    fn new(listeners: Listeners) -> Self {
        Self {
            listeners,
            lanes: HashMap::new(),
        }
    }

    fn route(&mut self, name: String, payload: Vec<u8>) {
        let Some(channel) = ManagementChannel::parse(&name) else {
            debug!(channel = %name, "unknown channel, dropping");
            return;
        };
        let listeners = &self.listeners;
        let lane = self
            .lanes
            .entry(channel)
            .or_insert_with(|| spawn_lane(channel, listeners.clone()));
        if let Err(mpsc::error::SendError((name, payload))) = lane.send((name, payload)) {
            // The lane ended; start a fresh one.
            let lane = spawn_lane(channel, listeners.clone());
            let _ = lane.send((name, payload));
            self.lanes.insert(channel, lane);
        }
    }
}

fn spawn_lane(channel: ManagementChannel, listeners: Listeners) -> mpsc::UnboundedSender<Inbound> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
    tokio::spawn(async move {
        while let Some((name, payload)) = rx.recv().await {
            let listener = listeners.get(&channel).map(|l| Arc::clone(l.value()));
            match listener {
                Some(listener) => listener.on_message(&name, &payload).await,
                None => debug!(channel = %name, "no listener, dropping"),
            }
        }
    });
    tx
}

/// Transport over an MQTT broker connection.
pub struct MqttTransport {
    client: AsyncClient,
    scheme: TopicScheme,
    listeners: Listeners,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create the client and start polling its event loop.
    ///
    /// The connection is (re)established in the background; publishes fail
    /// with [`Error::NotConnected`] until the broker acknowledges it.
    pub fn connect(config: MqttTransportConfig) -> Self {
        let client_id = if config.client_id.is_empty() {
            format!("dm-{}", uuid::Uuid::new_v4())
        } else {
            config.client_id.clone()
        };
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let listeners: Listeners = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(false));

        // Inbound payloads are handed to a separate task so listeners can
        // publish without stalling the event loop.
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
        let mut lanes = DeliveryLanes::new(listeners.clone());
        let delivery = tokio::spawn(async move {
            while let Some((name, payload)) = inbound_rx.recv().await {
                lanes.route(name, payload);
            }
        });

        let scheme = config.scheme.clone();
        let host = config.host.clone();
        let loop_client = client.clone();
        let loop_listeners = listeners.clone();
        let loop_connected = connected.clone();
        let poller = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        loop_connected.store(true, Ordering::SeqCst);
                        info!(host = %host, "MQTT connected");
                        // Clean sessions drop subscriptions across reconnects.
                        for entry in loop_listeners.iter() {
                            if let Some(filter) = scheme.subscribe_filter(*entry.key()) {
                                if let Err(e) = loop_client.try_subscribe(filter, QoS::AtLeastOnce) {
                                    warn!("Failed to resubscribe {}: {}", entry.key(), e);
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match scheme.route(&publish.topic) {
                            Some(name) => {
                                if inbound_tx.send((name, publish.payload.to_vec())).is_err() {
                                    break;
                                }
                            }
                            None => debug!(topic = %publish.topic, "unrouted topic"),
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        loop_connected.store(false, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if loop_connected.swap(false, Ordering::SeqCst) {
                            warn!("MQTT connection lost: {}", e);
                        } else {
                            debug!("MQTT connect attempt failed: {}", e);
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            scheme: config.scheme,
            listeners,
            connected,
            tasks: Mutex::new(vec![poller, delivery]),
        }
    }

    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Disconnect and stop the background tasks.
    pub async fn shutdown(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {}", e);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, channel: ManagementChannel, payload: Vec<u8>, qos: u8) -> Result<()> {
        let topic = self
            .scheme
            .publish_topic(channel)
            .ok_or_else(|| Error::Transport(format!("{} is not a device channel", channel)))?;
        if !self.is_connected() {
            return Err(Error::NotConnected(topic));
        }
        self.client
            .publish(topic, to_qos(qos), false, payload)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn subscribe(
        &self,
        channel: ManagementChannel,
        listener: Arc<dyn MessageListener>,
    ) -> Result<()> {
        let filter = self
            .scheme
            .subscribe_filter(channel)
            .ok_or_else(|| Error::Transport(format!("{} is not a server channel", channel)))?;
        self.listeners.insert(channel, listener);
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn unsubscribe(&self, channel: ManagementChannel) -> Result<()> {
        self.listeners.remove(&channel);
        if let Some(filter) = self.scheme.subscribe_filter(channel) {
            self.client
                .unsubscribe(filter)
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl MessageListener for Recorder {
        async fn on_message(&self, channel: &str, _payload: &[u8]) {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.seen.lock().push(channel.to_string());
        }
    }

    fn recorder(gate: Option<Arc<Notify>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            gate,
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_block_other_channels() {
        let gate = Arc::new(Notify::new());
        let slow = recorder(Some(gate.clone()));
        let fast = recorder(None);
        let listeners: Listeners = Arc::new(DashMap::new());
        listeners.insert(ManagementChannel::Reboot, slow.clone());
        listeners.insert(ManagementChannel::Response, fast.clone());
        let mut lanes = DeliveryLanes::new(listeners);

        lanes.route("reboot".into(), Vec::new());
        lanes.route("response".into(), Vec::new());
        settle().await;
        assert_eq!(*fast.seen.lock(), vec!["response".to_string()]);
        assert!(slow.seen.lock().is_empty());

        gate.notify_one();
        settle().await;
        assert_eq!(*slow.seen.lock(), vec!["reboot".to_string()]);
    }

    #[tokio::test]
    async fn test_same_channel_keeps_order() {
        let listener = recorder(None);
        let listeners: Listeners = Arc::new(DashMap::new());
        listeners.insert(ManagementChannel::CustomAction, listener.clone());
        let mut lanes = DeliveryLanes::new(listeners);

        for name in ["custom/a/one", "custom/a/two", "custom/b/three"] {
            lanes.route(name.into(), Vec::new());
        }
        settle().await;
        assert_eq!(
            *listener.seen.lock(),
            vec!["custom/a/one", "custom/a/two", "custom/b/three"]
        );
    }

    #[test]
    fn test_device_topics() {
        let scheme = TopicScheme::Device;
        assert_eq!(
            scheme.publish_topic(ManagementChannel::Manage).as_deref(),
            Some("iotdevice-1/mgmt/manage")
        );
        assert_eq!(
            scheme.subscribe_filter(ManagementChannel::Reboot).as_deref(),
            Some("iotdm-1/mgmt/initiate/device/reboot")
        );
        assert_eq!(scheme.publish_topic(ManagementChannel::Observe), None);
        assert_eq!(scheme.subscribe_filter(ManagementChannel::Notify), None);
    }

    #[test]
    fn test_gateway_topics() {
        let scheme = TopicScheme::Gateway {
            type_id: "sensor".into(),
            device_id: "d7".into(),
        };
        assert_eq!(
            scheme.publish_topic(ManagementChannel::Notify).as_deref(),
            Some("iotdevice-1/type/sensor/id/d7/notify")
        );
        assert_eq!(
            scheme.route("iotdm-1/type/sensor/id/d7/observe").as_deref(),
            Some("observe")
        );
        assert_eq!(scheme.route("iotdm-1/type/sensor/id/other/observe"), None);
    }

    #[test]
    fn test_route_inbound_topics() {
        let scheme = TopicScheme::Device;
        assert_eq!(scheme.route("iotdm-1/response").as_deref(), Some("response"));
        assert_eq!(
            scheme.route("iotdm-1/mgmt/initiate/firmware/update").as_deref(),
            Some("firmware-update")
        );
        assert_eq!(
            scheme.route("iotdm-1/mgmt/custom/lights/toggle").as_deref(),
            Some("custom/lights/toggle")
        );
        assert_eq!(scheme.route("iotdm-1/something/else").as_deref(), Some("generic"));
        assert_eq!(scheme.route("iotdevice-1/notify"), None);
    }
}
