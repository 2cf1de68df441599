//! Inbound request dispatch.
//!
//! A [`Dispatcher`] is the transport listener for every management channel
//! of one endpoint. It decodes the envelope, looks the handler up in the
//! session's [`HandlerRegistry`], runs it and publishes the correlated
//! response. Responses to device-originated requests are forwarded to the
//! [`ChangeNotifier`].
//!
//! Requests on the same channel are handled one at a time; different
//! channels proceed concurrently.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::channel::ManagementChannel;
use crate::codec::Codec;
use crate::envelope::{Envelope, ResponseCode};
use crate::error::Result;
use crate::notifier::ChangeNotifier;
use crate::transport::MessageListener;

/// Handles requests arriving on one channel.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Channel this handler serves.
    fn channel(&self) -> ManagementChannel;

    /// Handle one request. `channel` is the full inbound channel name.
    ///
    /// Returning `Ok(None)` sends no response.
    async fn handle(&self, channel: &str, request: Envelope) -> Result<Option<Envelope>>;
}

struct HandlerEntry {
    handler: Arc<dyn RequestHandler>,
    gate: tokio::sync::Mutex<()>,
}

/// Channel to handler table of one management session.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<ManagementChannel, Arc<HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for the channel it declares.
    pub fn register(&self, handler: Arc<dyn RequestHandler>) {
        self.register_for(handler.channel(), handler);
    }

    /// Register `handler` for an explicit channel, replacing any previous one.
    pub fn register_for(&self, channel: ManagementChannel, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(
            channel,
            Arc::new(HandlerEntry {
                handler,
                gate: tokio::sync::Mutex::new(()),
            }),
        );
    }

    pub fn unregister(&self, channel: ManagementChannel) -> bool {
        self.handlers.remove(&channel).is_some()
    }

    pub fn contains(&self, channel: ManagementChannel) -> bool {
        self.handlers.contains_key(&channel)
    }

    pub fn channels(&self) -> Vec<ManagementChannel> {
        self.handlers.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn entry(&self, channel: ManagementChannel) -> Option<Arc<HandlerEntry>> {
        self.handlers.get(&channel).map(|e| Arc::clone(e.value()))
    }
}

/// Routes inbound payloads to handlers.
pub struct Dispatcher {
    codec: Arc<dyn Codec>,
    notifier: Arc<ChangeNotifier>,
    registry: RwLock<Option<Arc<HandlerRegistry>>>,
}

impl Dispatcher {
    pub fn new(codec: Arc<dyn Codec>, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            codec,
            notifier,
            registry: RwLock::new(None),
        }
    }

    /// Install the handler table of a new session.
    pub fn install(&self, registry: Arc<HandlerRegistry>) {
        *self.registry.write() = Some(registry);
    }

    /// Tear the session's handler table down.
    pub fn clear(&self) -> Option<Arc<HandlerRegistry>> {
        self.registry.write().take()
    }

    pub fn registry(&self) -> Option<Arc<HandlerRegistry>> {
        self.registry.read().clone()
    }

    /// Add a handler to the active table, creating one if needed.
    pub fn register_handler(&self, channel: ManagementChannel, handler: Arc<dyn RequestHandler>) {
        let mut guard = self.registry.write();
        guard
            .get_or_insert_with(|| Arc::new(HandlerRegistry::new()))
            .register_for(channel, handler);
    }

    /// Dispatch one inbound payload.
    ///
    /// Returns the response that was published, if any. Never fails: unknown
    /// channels are dropped and handler failures become 500 responses.
    pub async fn dispatch(&self, channel_name: &str, payload: &[u8]) -> Option<Envelope> {
        let Some(channel) = ManagementChannel::parse(channel_name) else {
            warn!(channel = channel_name, "unknown channel, dropping message");
            return None;
        };

        if channel == ManagementChannel::Response {
            match Envelope::decode(self.codec.as_ref(), payload) {
                Ok(envelope) => {
                    self.notifier.resolve(envelope);
                }
                Err(e) => warn!("malformed response dropped: {}", e),
            }
            return None;
        }

        let entry = self.registry().and_then(|r| r.entry(channel));
        let Some(entry) = entry else {
            debug!(channel = channel_name, "no handler registered, dropping message");
            return None;
        };

        let request = match Envelope::decode(self.codec.as_ref(), payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(channel = channel_name, "malformed request: {}", e);
                let request_id = Envelope::salvage_request_id(self.codec.as_ref(), payload);
                let response =
                    Envelope::response(request_id, ResponseCode::BadRequest).with_message(e.to_string());
                self.respond(channel_name, &response).await;
                return Some(response);
            }
        };

        let _gate = entry.gate.lock().await;
        let request_id = request.request_id.clone();
        let outcome = AssertUnwindSafe(entry.handler.handle(channel_name, request))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(Some(mut response))) => {
                response.request_id = request_id;
                response
            }
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                warn!(channel = channel_name, "handler failed: {}", e);
                Envelope::response(request_id, ResponseCode::InternalError).with_message(e.to_string())
            }
            Err(_) => {
                error!(channel = channel_name, "handler panicked");
                Envelope::response(request_id, ResponseCode::InternalError)
                    .with_message("internal error")
            }
        };

        self.respond(channel_name, &response).await;
        Some(response)
    }

    async fn respond(&self, channel_name: &str, response: &Envelope) {
        if let Err(e) = self
            .notifier
            .publish(ManagementChannel::Response, response)
            .await
        {
            warn!(channel = channel_name, "response not delivered: {}", e);
        }
    }
}

#[async_trait]
impl MessageListener for Dispatcher {
    async fn on_message(&self, channel: &str, payload: &[u8]) {
        self.dispatch(channel, payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::error::Error;
    use crate::transport::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        fn channel(&self) -> ManagementChannel {
            ManagementChannel::Generic
        }

        async fn handle(&self, _channel: &str, request: Envelope) -> Result<Option<Envelope>> {
            let mut response = Envelope::response_to(&request, ResponseCode::Success);
            // Handlers cannot break correlation.
            response.request_id = Some("tampered".into());
            Ok(Some(response))
        }
    }

    struct Failing;

    #[async_trait]
    impl RequestHandler for Failing {
        fn channel(&self) -> ManagementChannel {
            ManagementChannel::Observe
        }

        async fn handle(&self, _channel: &str, _request: Envelope) -> Result<Option<Envelope>> {
            Err(Error::Handler("boom".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl RequestHandler for Panicking {
        fn channel(&self) -> ManagementChannel {
            ManagementChannel::Cancel
        }

        async fn handle(&self, _channel: &str, _request: Envelope) -> Result<Option<Envelope>> {
            panic!("handler bug");
        }
    }

    struct Slow {
        active: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RequestHandler for Slow {
        fn channel(&self) -> ManagementChannel {
            ManagementChannel::DeviceUpdate
        }

        async fn handle(&self, _channel: &str, _request: Envelope) -> Result<Option<Envelope>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn create_test_dispatcher() -> (Arc<MemoryTransport>, Arc<Dispatcher>) {
        let transport = Arc::new(MemoryTransport::new());
        let notifier = Arc::new(ChangeNotifier::new(
            transport.clone(),
            Arc::new(JsonCodec),
            1,
            Duration::from_secs(1),
        ));
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(JsonCodec), notifier));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(Failing));
        registry.register(Arc::new(Panicking));
        dispatcher.install(registry);
        (transport, dispatcher)
    }

    #[tokio::test]
    async fn test_unregistered_channel_publishes_nothing() {
        let (transport, dispatcher) = create_test_dispatcher();
        let payload = br#"{"d":{},"reqId":"r1"}"#;
        assert!(dispatcher.dispatch("reboot", payload).await.is_none());
        assert!(dispatcher.dispatch("no-such-channel", payload).await.is_none());
        assert!(dispatcher.dispatch("firmware-update", b"garbage").await.is_none());
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_response_keeps_request_id() {
        let (transport, dispatcher) = create_test_dispatcher();
        let response = dispatcher
            .dispatch("generic", br#"{"d":{},"reqId":"r9"}"#)
            .await
            .unwrap();
        assert_eq!(response.request_id.as_deref(), Some("r9"));
        let sent = transport.published_on(ManagementChannel::Response);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].rc(), Some(ResponseCode::Success));
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_500() {
        let (transport, dispatcher) = create_test_dispatcher();
        let failed = dispatcher
            .dispatch("observe", br#"{"reqId":"a"}"#)
            .await
            .unwrap();
        assert_eq!(failed.rc(), Some(ResponseCode::InternalError));
        assert_eq!(failed.request_id.as_deref(), Some("a"));

        let panicked = dispatcher
            .dispatch("cancel", br#"{"reqId":"b"}"#)
            .await
            .unwrap();
        assert_eq!(panicked.rc(), Some(ResponseCode::InternalError));

        // The dispatcher keeps working afterwards.
        assert!(dispatcher.dispatch("generic", br#"{"reqId":"c"}"#).await.is_some());
        assert_eq!(transport.published_on(ManagementChannel::Response).len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_request_is_bad_request() {
        let (_transport, dispatcher) = create_test_dispatcher();
        let response = dispatcher
            .dispatch("generic", br#"{"reqId":"m1","d":{},"rc":"x"}"#)
            .await
            .unwrap();
        assert_eq!(response.rc(), Some(ResponseCode::BadRequest));
        assert_eq!(response.request_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_same_channel_is_serialized() {
        let (_transport, dispatcher) = create_test_dispatcher();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        dispatcher.register_handler(
            ManagementChannel::DeviceUpdate,
            Arc::new(Slow {
                active: active.clone(),
                max_seen: max_seen.clone(),
            }),
        );

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch("device-update", br#"{"reqId":"s"}"#).await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleared_registry_drops_requests() {
        let (transport, dispatcher) = create_test_dispatcher();
        assert!(dispatcher.clear().is_some());
        assert!(dispatcher.dispatch("generic", br#"{"reqId":"x"}"#).await.is_none());
        assert!(transport.published().is_empty());
    }
}
