//! Server observations of resources.
//!
//! Observing a field snapshots its value and subscribes to server-scope
//! changes. Each change is diffed against the last value sent; only the
//! changed part goes out as a notification, and nothing goes out when
//! nothing changed.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::channel::ManagementChannel;
use crate::device_data::DeviceData;
use crate::notifier::ChangeNotifier;
use crate::resource::{ListenerId, ListenerScope, ManagedResource, ResourceChange};

/// `{"fields": [{"field": name, "value": value}]}`
pub fn fields_payload(name: &str, value: Value) -> Value {
    json!({ "fields": [{ "field": name, "value": value }] })
}

/// Compute what changed between `last` and `current` and fold it into `last`.
///
/// Objects are compared per top-level key and a key that disappeared is
/// reported as `null`; any other value is compared as a whole. Returns `None`
/// when nothing changed.
pub fn diff_and_update(last: &mut Value, current: &Value) -> Option<Value> {
    match (last, current) {
        (Value::Object(last), Value::Object(current)) => {
            let mut changed = Map::new();
            let removed: Vec<String> = last
                .keys()
                .filter(|key| !current.contains_key(key.as_str()))
                .cloned()
                .collect();
            for key in removed {
                last.remove(&key);
                changed.insert(key, Value::Null);
            }
            for (key, value) in current {
                if last.get(key) != Some(value) {
                    last.insert(key.clone(), value.clone());
                    changed.insert(key.clone(), value.clone());
                }
            }
            (!changed.is_empty()).then_some(Value::Object(changed))
        }
        (last, current) => {
            if last == current {
                None
            } else {
                *last = current.clone();
                Some(current.clone())
            }
        }
    }
}

struct Observation {
    resource: Arc<dyn ManagedResource>,
    listener_id: ListenerId,
    last_sent: Value,
}

/// Fields the server currently observes.
pub struct ObservationRegistry {
    device: Arc<DeviceData>,
    notifier: Arc<ChangeNotifier>,
    observed: DashMap<String, Observation>,
}

impl ObservationRegistry {
    pub fn new(device: Arc<DeviceData>, notifier: Arc<ChangeNotifier>) -> Arc<Self> {
        Arc::new(Self {
            device,
            notifier,
            observed: DashMap::new(),
        })
    }

    /// Start observing `field`. Returns its current value, or `None` when no
    /// resource has that name. Observing twice refreshes the snapshot.
    pub fn observe(self: &Arc<Self>, field: &str) -> Option<Value> {
        let resource = self.device.resolve(field)?;

        if let Some(mut existing) = self.observed.get_mut(field) {
            let value = existing.resource.to_json();
            existing.last_sent = value.clone();
            return Some(value);
        }

        // Subscribe before taking the snapshot: a change racing in between is
        // then either in the snapshot or delivered afterwards.
        let listener = ObservationListener {
            registry: Arc::downgrade(self),
        };
        let listener_id = resource.subscribe(ListenerScope::Server, Arc::new(listener));
        let value = resource.to_json();
        let previous = self.observed.insert(
            field.to_string(),
            Observation {
                resource: resource.clone(),
                listener_id,
                last_sent: value.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.resource.unsubscribe(previous.listener_id);
        }
        debug!(field, "observing");
        Some(value)
    }

    /// Stop observing `field`. Returns false when it was not observed.
    pub fn cancel(&self, field: &str) -> bool {
        match self.observed.remove(field) {
            Some((_, observation)) => {
                observation.resource.unsubscribe(observation.listener_id);
                debug!(field, "observation cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let fields: Vec<String> = self.observed.iter().map(|e| e.key().clone()).collect();
        for field in fields {
            self.cancel(&field);
        }
    }

    pub fn is_observed(&self, field: &str) -> bool {
        self.observed.contains_key(field)
    }

    pub fn observed_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.observed.iter().map(|e| e.key().clone()).collect();
        fields.sort();
        fields
    }

    fn on_change(&self, change: &ResourceChange) {
        let trimmed = {
            let Some(mut observation) = self.observed.get_mut(&change.name) else {
                return;
            };
            diff_and_update(&mut observation.last_sent, &change.value)
        };
        match trimmed {
            Some(value) => {
                self.notifier
                    .enqueue(ManagementChannel::Notify, fields_payload(&change.name, value));
            }
            None => debug!(field = %change.name, "unchanged, notification suppressed"),
        }
    }
}

impl Drop for ObservationRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

struct ObservationListener {
    registry: Weak<ObservationRegistry>,
}

impl crate::resource::ResourceListener for ObservationListener {
    fn on_change(&self, change: &ResourceChange) {
        if let Some(registry) = self.registry.upgrade() {
            registry.on_change(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::resource::DeviceLocation;
    use crate::transport::MemoryTransport;
    use std::time::Duration;

    fn create_test_registry() -> (Arc<MemoryTransport>, Arc<DeviceData>, Arc<ObservationRegistry>) {
        let transport = Arc::new(MemoryTransport::new());
        let notifier = Arc::new(ChangeNotifier::new(
            transport.clone(),
            Arc::new(JsonCodec),
            1,
            Duration::from_secs(1),
        ));
        notifier.start();
        let device = Arc::new(DeviceData::builder("t", "d").build());
        let registry = ObservationRegistry::new(device.clone(), notifier);
        (transport, device, registry)
    }

    #[test]
    fn test_diff_objects_per_key() {
        let mut last = json!({"a": 1, "b": 2});
        assert_eq!(diff_and_update(&mut last, &json!({"a": 1, "b": 3})), Some(json!({"b": 3})));
        assert_eq!(last, json!({"a": 1, "b": 3}));
        assert_eq!(diff_and_update(&mut last, &json!({"a": 1, "b": 3})), None);
    }

    #[test]
    fn test_diff_reports_removed_keys_as_null() {
        let mut last = json!({"version": "1.0", "verifier": "abc"});
        assert_eq!(
            diff_and_update(&mut last, &json!({"version": "1.0"})),
            Some(json!({"verifier": null}))
        );
        assert_eq!(last, json!({"version": "1.0"}));
        assert_eq!(diff_and_update(&mut last, &json!({"version": "1.0"})), None);
        assert_eq!(
            diff_and_update(&mut last, &json!({"version": "1.0", "verifier": "abc"})),
            Some(json!({"verifier": "abc"}))
        );
    }

    #[test]
    fn test_diff_primitives() {
        let mut last = json!(5);
        assert_eq!(diff_and_update(&mut last, &json!(5)), None);
        assert_eq!(diff_and_update(&mut last, &json!(6)), Some(json!(6)));
        assert_eq!(last, json!(6));
    }

    #[tokio::test]
    async fn test_observed_change_is_notified_with_diff() {
        let (transport, device, registry) = create_test_registry();
        let snapshot = registry.observe("location").unwrap();
        assert_eq!(snapshot["latitude"], 0.0);

        device.location().apply_local_update(|l| l.latitude = 12.5);
        let sent = transport
            .wait_for(ManagementChannel::Notify, 1, Duration::from_secs(1))
            .await;
        assert_eq!(
            sent[0].data,
            Some(json!({"fields": [{"field": "location", "value": {"latitude": 12.5}}]}))
        );
        assert!(sent[0].request_id.is_some());
    }

    #[tokio::test]
    async fn test_cleared_then_restored_key_is_notified_each_time() {
        let (transport, device, registry) = create_test_registry();
        device
            .location()
            .apply_local_update(|l| l.elevation = Some(35.0));
        registry.observe("location").unwrap();

        device.location().apply_local_update(|l| l.elevation = None);
        device
            .location()
            .apply_local_update(|l| l.elevation = Some(35.0));

        let sent = transport
            .wait_for(ManagementChannel::Notify, 2, Duration::from_secs(1))
            .await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data.as_ref().unwrap()["fields"][0]["value"], json!({"elevation": null}));
        assert_eq!(sent[1].data.as_ref().unwrap()["fields"][0]["value"], json!({"elevation": 35.0}));
    }

    #[tokio::test]
    async fn test_unchanged_value_is_suppressed() {
        let (transport, device, registry) = create_test_registry();
        registry.observe("location").unwrap();
        device.location().set(DeviceLocation::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.published_on(ManagementChannel::Notify).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_notifications() {
        let (transport, device, registry) = create_test_registry();
        registry.observe("location").unwrap();
        assert!(registry.cancel("location"));
        assert!(!registry.cancel("location"));
        device.location().apply_local_update(|l| l.longitude = 1.0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.published_on(ManagementChannel::Notify).is_empty());
        assert_eq!(device.location().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_field_is_not_observed() {
        let (_transport, _device, registry) = create_test_registry();
        assert!(registry.observe("nope").is_none());
        assert!(registry.observed_fields().is_empty());
    }

    #[tokio::test]
    async fn test_observe_twice_keeps_single_listener() {
        let (_transport, device, registry) = create_test_registry();
        registry.observe("location").unwrap();
        registry.observe("location").unwrap();
        assert_eq!(device.location().listener_count(), 1);
        drop(registry);
        assert_eq!(device.location().listener_count(), 0);
    }
}
