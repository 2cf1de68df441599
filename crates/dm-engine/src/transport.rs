//! Publish/subscribe transport seam.
//!
//! The engine consumes a transport as two capabilities: publishing a payload
//! on a channel, and receiving payloads for the channels it subscribed to.
//! [`MemoryTransport`] is an in-process implementation used by tests and
//! simulations; the MQTT adapter lives in [`crate::mqtt`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::channel::ManagementChannel;
use crate::codec::{Codec, JsonCodec};
use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// Receives inbound payloads for a subscribed channel.
///
/// `channel` is the full channel name, e.g. `observe` or
/// `custom/lights/toggle`.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, channel: &str, payload: &[u8]);
}

/// Topic-addressed publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: ManagementChannel, payload: Vec<u8>, qos: u8) -> Result<()>;

    /// Route inbound traffic for `channel` to `listener`, replacing any previous one.
    async fn subscribe(
        &self,
        channel: ManagementChannel,
        listener: Arc<dyn MessageListener>,
    ) -> Result<()>;

    /// Stop routing inbound traffic for `channel`.
    async fn unsubscribe(&self, channel: ManagementChannel) -> Result<()>;

    /// Whether publishes can currently be delivered.
    fn is_connected(&self) -> bool;
}

/// A payload recorded by [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct Published {
    pub channel: ManagementChannel,
    pub payload: Vec<u8>,
    pub qos: u8,
}

impl Published {
    /// Decode the payload as an envelope.
    pub fn envelope(&self) -> Result<Envelope> {
        Envelope::decode(&JsonCodec, &self.payload)
    }
}

/// Produces the server's answer to a device-originated request.
pub type Responder = Arc<dyn Fn(ManagementChannel, &Envelope) -> Option<Envelope> + Send + Sync>;

/// In-process transport.
///
/// Records every publish, delivers inbound payloads to subscribed
/// listeners, and can impersonate the server through a [`Responder`].
pub struct MemoryTransport {
    connected: AtomicBool,
    listeners: DashMap<ManagementChannel, Arc<dyn MessageListener>>,
    published: Mutex<Vec<Published>>,
    responder: RwLock<Option<Responder>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            listeners: DashMap::new(),
            published: Mutex::new(Vec::new()),
            responder: RwLock::new(None),
        }
    }

    /// Simulate connection loss or recovery.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Answer device-originated requests automatically.
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.write() = Some(responder);
    }

    /// Answer every request on `channel` with `rc`.
    pub fn respond_with(&self, channel: ManagementChannel, rc: crate::envelope::ResponseCode) {
        self.set_responder(Arc::new(move |published_on, request| {
            (published_on == channel).then(|| Envelope::response_to(request, rc))
        }));
    }

    pub fn is_subscribed(&self, channel: ManagementChannel) -> bool {
        self.listeners.contains_key(&channel)
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    /// Envelopes published on `channel`, oldest first.
    pub fn published_on(&self, channel: ManagementChannel) -> Vec<Envelope> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.channel == channel)
            .filter_map(|p| p.envelope().ok())
            .collect()
    }

    pub fn clear_published(&self) {
        self.published.lock().clear();
    }

    /// Wait until at least `count` envelopes were published on `channel`.
    ///
    /// Returns whatever was published when the deadline passes.
    pub async fn wait_for(
        &self,
        channel: ManagementChannel,
        count: usize,
        timeout: Duration,
    ) -> Vec<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let seen = self.published_on(channel);
            if seen.len() >= count || tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Deliver a raw inbound payload. Returns false when nobody listens.
    pub async fn deliver(&self, channel_name: &str, payload: &[u8]) -> bool {
        let Some(channel) = ManagementChannel::parse(channel_name) else {
            debug!(channel = channel_name, "no such channel, dropping");
            return false;
        };
        let listener = self.listeners.get(&channel).map(|l| Arc::clone(l.value()));
        match listener {
            Some(listener) => {
                listener.on_message(channel_name, payload).await;
                true
            }
            None => false,
        }
    }

    /// Deliver an envelope encoded as JSON.
    pub async fn deliver_envelope(&self, channel_name: &str, envelope: &Envelope) -> bool {
        match envelope.encode(&JsonCodec) {
            Ok(bytes) => self.deliver(channel_name, &bytes).await,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, channel: ManagementChannel, payload: Vec<u8>, qos: u8) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected(format!("cannot publish on {}", channel)));
        }
        let record = Published {
            channel,
            payload,
            qos,
        };
        let reply = {
            let responder = self.responder.read().clone();
            match (responder, record.envelope()) {
                (Some(responder), Ok(request)) => responder(channel, &request),
                _ => None,
            }
        };
        self.published.lock().push(record);

        if let Some(reply) = reply {
            self.deliver_envelope(ManagementChannel::Response.as_str(), &reply)
                .await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: ManagementChannel,
        listener: Arc<dyn MessageListener>,
    ) -> Result<()> {
        self.listeners.insert(channel, listener);
        Ok(())
    }

    async fn unsubscribe(&self, channel: ManagementChannel) -> Result<()> {
        self.listeners.remove(&channel);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
