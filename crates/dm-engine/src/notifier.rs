//! Outbound notifications and request/response correlation.
//!
//! Fire-and-forget sends carry a fresh request id and are not tracked.
//! Correlated sends register the id in a pending table before publishing
//! and wait for [`ChangeNotifier::resolve`] to hand them the matching
//! response. The pending entry is removed on success, on timeout and when
//! the waiting future is dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::ManagementChannel;
use crate::codec::Codec;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::transport::Transport;

struct Outbound {
    channel: ManagementChannel,
    envelope: Envelope,
}

struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Envelope>>,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

/// Publishes notifications and correlates responses.
pub struct ChangeNotifier {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    qos: u8,
    default_timeout: Duration,
    pending: DashMap<String, oneshot::Sender<Envelope>>,
    outbox: mpsc::UnboundedSender<Outbound>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeNotifier {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        qos: u8,
        default_timeout: Duration,
    ) -> Self {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            codec,
            qos,
            default_timeout,
            pending: DashMap::new(),
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            pump: Mutex::new(None),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Start draining the queue filled by [`enqueue`](Self::enqueue).
    ///
    /// Must run inside a tokio runtime. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(mut rx) = self.outbox_rx.lock().take() else {
            return;
        };
        let transport = self.transport.clone();
        let codec = self.codec.clone();
        let qos = self.qos;
        let handle = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                if let Err(e) =
                    send(transport.as_ref(), codec.as_ref(), qos, outbound.channel, &outbound.envelope)
                        .await
                {
                    warn!(channel = %outbound.channel, "dropping notification: {}", e);
                }
            }
        });
        *self.pump.lock() = Some(handle);
    }

    /// Stop the queue pump. Queued notifications are discarded.
    pub fn stop(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }

    /// Publish an envelope as is.
    pub async fn publish(&self, channel: ManagementChannel, envelope: &Envelope) -> Result<()> {
        send(self.transport.as_ref(), self.codec.as_ref(), self.qos, channel, envelope).await
    }

    /// Fire-and-forget notification. Returns the generated request id.
    pub async fn notify(&self, data: Value) -> Result<String> {
        self.send_untracked(ManagementChannel::Notify, Some(data)).await
    }

    /// Fire-and-forget send on any outbound channel.
    pub async fn send_untracked(
        &self,
        channel: ManagementChannel,
        data: Option<Value>,
    ) -> Result<String> {
        let envelope = Envelope::request(data);
        let request_id = envelope.request_id.clone().unwrap_or_default();
        self.publish(channel, &envelope).await?;
        Ok(request_id)
    }

    /// Queue a fire-and-forget send from synchronous code.
    ///
    /// Queued sends are published in order once [`start`](Self::start) ran.
    pub fn enqueue(&self, channel: ManagementChannel, data: Value) -> String {
        let envelope = Envelope::request(Some(data));
        let request_id = envelope.request_id.clone().unwrap_or_default();
        if self.outbox.send(Outbound { channel, envelope }).is_err() {
            debug!(channel = %channel, "notifier queue closed");
        }
        request_id
    }

    /// Notify and wait for the correlated response.
    ///
    /// Returns `None` when nothing arrived within `timeout` or the publish failed.
    pub async fn notify_and_wait(&self, data: Value, timeout: Duration) -> Option<Envelope> {
        self.request(ManagementChannel::Notify, Some(data), timeout).await
    }

    /// Send on `channel` and wait for the correlated response.
    pub async fn request(
        &self,
        channel: ManagementChannel,
        data: Option<Value>,
        timeout: Duration,
    ) -> Option<Envelope> {
        let envelope = Envelope::request(data);
        let request_id = envelope.request_id.clone()?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        if let Err(e) = self.publish(channel, &envelope).await {
            warn!(channel = %channel, req_id = %request_id, "request not sent: {}", e);
            return None;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(channel = %channel, req_id = %request_id, "no response within {:?}", timeout);
                None
            }
        }
    }

    /// [`request`](Self::request) that turns a missing response into an error.
    pub async fn request_or_timeout(
        &self,
        channel: ManagementChannel,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<Envelope> {
        self.request(channel, data, timeout)
            .await
            .ok_or_else(|| Error::Timeout(format!("no response on {}", channel)))
    }

    /// Complete the waiter registered for the envelope's request id.
    ///
    /// Returns false when nobody waits for it.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(request_id) = envelope.request_id.as_deref() else {
            debug!("response without reqId ignored");
            return false;
        };
        match self.pending.remove(request_id) {
            Some((_, tx)) => tx.send(envelope).is_ok(),
            None => {
                debug!(req_id = %request_id, "no pending request for response");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn send(
    transport: &dyn Transport,
    codec: &dyn Codec,
    qos: u8,
    channel: ManagementChannel,
    envelope: &Envelope,
) -> Result<()> {
    let payload = envelope.encode(codec)?;
    transport.publish(channel, payload, qos).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::envelope::ResponseCode;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn create_test_notifier() -> (Arc<MemoryTransport>, Arc<ChangeNotifier>) {
        let transport = Arc::new(MemoryTransport::new());
        let notifier = Arc::new(ChangeNotifier::new(
            transport.clone(),
            Arc::new(JsonCodec),
            1,
            Duration::from_secs(5),
        ));
        (transport, notifier)
    }

    #[tokio::test]
    async fn test_notify_and_wait_times_out() {
        let (transport, notifier) = create_test_notifier();
        let result = notifier
            .notify_and_wait(json!({"x": 1}), Duration::from_millis(50))
            .await;
        assert!(result.is_none());
        assert_eq!(notifier.pending_count(), 0);
        assert_eq!(transport.published_on(ManagementChannel::Notify).len(), 1);
    }

    #[tokio::test]
    async fn test_notify_and_wait_returns_matching_response() {
        let (transport, notifier) = create_test_notifier();

        let waiter = {
            let notifier = notifier.clone();
            tokio::spawn(async move {
                notifier
                    .notify_and_wait(json!({"x": 1}), Duration::from_secs(2))
                    .await
            })
        };

        let sent = transport
            .wait_for(ManagementChannel::Notify, 1, Duration::from_secs(1))
            .await;
        let request = sent.first().cloned().unwrap();

        // An unrelated response must not complete the waiter.
        let stray = Envelope::response(Some("other".into()), ResponseCode::Success);
        assert!(!notifier.resolve(stray));

        let response = Envelope::response_to(&request, ResponseCode::Success);
        assert!(notifier.resolve(response.clone()));

        let received = waiter.await.unwrap();
        assert_eq!(received, Some(response));
        assert_eq!(notifier.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_fails_fast_when_disconnected() {
        let (transport, notifier) = create_test_notifier();
        transport.set_connected(false);
        let started = std::time::Instant::now();
        let result = notifier
            .request(ManagementChannel::Manage, None, Duration::from_secs(5))
            .await;
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(notifier.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueued_notifications_keep_order() {
        let (transport, notifier) = create_test_notifier();
        notifier.start();
        for i in 0..5 {
            notifier.enqueue(ManagementChannel::Notify, json!({ "seq": i }));
        }
        let sent = transport
            .wait_for(ManagementChannel::Notify, 5, Duration::from_secs(1))
            .await;
        let seqs: Vec<i64> = sent
            .iter()
            .map(|e| e.data.as_ref().unwrap()["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        notifier.stop();
    }

    #[tokio::test]
    async fn test_fresh_request_ids() {
        let (transport, notifier) = create_test_notifier();
        let a = notifier.notify(json!({})).await.unwrap();
        let b = notifier.notify(json!({})).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(transport.published().len(), 2);
    }
}
