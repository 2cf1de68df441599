//! Observable resource model.
//!
//! A [`Resource`] is a named, typed attribute of the managed endpoint.
//! Listeners subscribe with a [`ListenerScope`]:
//!
//! - [`ListenerScope::Server`] listeners see changes made by local code
//!   through [`Resource::apply_local_update`]. The observation registry
//!   subscribes here.
//! - [`ListenerScope::Application`] listeners see changes the server made
//!   through [`ManagedResource::apply_remote_update`]. Those never reach
//!   server-scope listeners, so a server write is never echoed back.

mod device_info;
mod diagnostics;
mod firmware;
mod location;

pub use device_info::{DeviceInfo, Metadata};
pub use diagnostics::{DiagnosticLog, ErrorCodes, LogEntry, LogSeverity};
pub use firmware::{DeviceFirmware, FirmwareState, FirmwareUpdateStatus};
pub use location::DeviceLocation;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::envelope::ResponseCode;
use crate::error::{Error, Result};

/// Canonical resource names.
pub mod names {
    pub const LOCATION: &str = "location";
    pub const DEVICE_INFO: &str = "deviceInfo";
    pub const METADATA: &str = "metadata";
    pub const FIRMWARE: &str = "mgmt.firmware";
    pub const ERROR_CODES: &str = "diag.errorCodes";
    pub const LOG: &str = "diag.log";
}

/// Dotted canonical name of `child` under `parent`.
pub fn canonical_name(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}.{}", parent, child)
    }
}

/// Identifies a listener subscription on one resource.
pub type ListenerId = u64;

/// Which class of changes a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerScope {
    /// Local mutations that the server should learn about.
    Server,
    /// Server-originated mutations the application should react to.
    Application,
}

/// A change event.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChange {
    /// Canonical resource name.
    pub name: String,
    /// Full value after the change.
    pub value: Value,
}

/// Receives change events.
pub trait ResourceListener: Send + Sync {
    fn on_change(&self, change: &ResourceChange);
}

impl<F> ResourceListener for F
where
    F: Fn(&ResourceChange) + Send + Sync,
{
    fn on_change(&self, change: &ResourceChange) {
        self(change)
    }
}

/// Merge `patch` into `target`. Objects merge per key, anything else replaces.
pub fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Types that can be stored in a [`Resource`].
pub trait ResourceValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Apply a server-supplied value.
    fn merge_remote(&mut self, patch: &Value) -> Result<()> {
        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, patch);
        *self = serde_json::from_value(current)?;
        Ok(())
    }
}

/// Object-safe view of a resource, used for lookup by name.
pub trait ManagedResource: Send + Sync {
    fn name(&self) -> &str;

    /// Current value as structured payload.
    fn to_json(&self) -> Value;

    /// Apply a server-originated value. Only application-scope listeners fire.
    fn apply_remote_update(&self, value: &Value) -> Result<()>;

    fn subscribe(&self, scope: ListenerScope, listener: Arc<dyn ResourceListener>) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> bool;

    /// Whether local changes must be acknowledged by the server.
    fn response_required(&self) -> bool;

    /// Response code of the last acknowledged change.
    fn response_code(&self) -> Option<ResponseCode>;

    fn set_response_code(&self, rc: Option<ResponseCode>);
}

struct Subscription {
    scope: ListenerScope,
    listener: Arc<dyn ResourceListener>,
}

/// A named, typed, observable attribute.
pub struct Resource<T> {
    name: String,
    value: RwLock<T>,
    response_required: AtomicBool,
    response_code: Mutex<Option<ResponseCode>>,
    listeners: DashMap<ListenerId, Subscription>,
    next_id: AtomicU64,
}

impl<T: ResourceValue> Resource<T> {
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            value: RwLock::new(value),
            response_required: AtomicBool::new(false),
            response_code: Mutex::new(None),
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_response_required(self, required: bool) -> Self {
        self.response_required.store(required, Ordering::SeqCst);
        self
    }

    pub fn set_response_required(&self, required: bool) {
        self.response_required.store(required, Ordering::SeqCst);
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Read without cloning.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    /// Mutate from local code and notify server-scope listeners.
    ///
    /// Listeners always fire, even when the value did not change; observers
    /// diff against what they last sent.
    pub fn apply_local_update(&self, f: impl FnOnce(&mut T)) -> Value {
        let value = {
            let mut guard = self.value.write();
            f(&mut guard);
            self.serialize(&guard)
        };
        self.fire(ListenerScope::Server, &value);
        value
    }

    /// Like [`apply_local_update`](Self::apply_local_update), but `f` may
    /// refuse the change. Listeners only fire when it succeeds.
    pub fn try_local_update<R, E>(
        &self,
        f: impl FnOnce(&mut T) -> std::result::Result<R, E>,
    ) -> std::result::Result<(R, Value), E> {
        let (result, value) = {
            let mut guard = self.value.write();
            let mut next = guard.clone();
            let result = f(&mut next)?;
            *guard = next;
            (result, self.serialize(&guard))
        };
        self.fire(ListenerScope::Server, &value);
        Ok((result, value))
    }

    /// Replace the value from local code.
    pub fn set(&self, value: T) -> Value {
        self.apply_local_update(|current| *current = value)
    }

    /// Number of active subscriptions.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn serialize(&self, value: &T) -> Value {
        serde_json::to_value(value).unwrap_or_else(|e| {
            debug!(resource = %self.name, "serialization failed: {}", e);
            Value::Null
        })
    }

    fn fire(&self, scope: ListenerScope, value: &Value) {
        // Snapshot first so listeners may subscribe or unsubscribe re-entrantly.
        let targets: Vec<Arc<dyn ResourceListener>> = self
            .listeners
            .iter()
            .filter(|entry| entry.value().scope == scope)
            .map(|entry| Arc::clone(&entry.value().listener))
            .collect();
        if targets.is_empty() {
            return;
        }
        let change = ResourceChange {
            name: self.name.clone(),
            value: value.clone(),
        };
        for listener in targets {
            listener.on_change(&change);
        }
    }
}

impl<T: ResourceValue> ManagedResource for Resource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn to_json(&self) -> Value {
        let guard = self.value.read();
        self.serialize(&guard)
    }

    fn apply_remote_update(&self, patch: &Value) -> Result<()> {
        let value = {
            let mut guard = self.value.write();
            let mut next = guard.clone();
            next.merge_remote(patch)
                .map_err(|e| Error::InvalidState(format!("{}: {}", self.name, e)))?;
            *guard = next;
            self.serialize(&guard)
        };
        self.fire(ListenerScope::Application, &value);
        Ok(())
    }

    fn subscribe(&self, scope: ListenerScope, listener: Arc<dyn ResourceListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(id, Subscription { scope, listener });
        id
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    fn response_required(&self) -> bool {
        self.response_required.load(Ordering::SeqCst)
    }

    fn response_code(&self) -> Option<ResponseCode> {
        *self.response_code.lock()
    }

    fn set_response_code(&self, rc: Option<ResponseCode>) {
        *self.response_code.lock() = rc;
    }
}
