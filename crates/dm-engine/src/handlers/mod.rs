//! Request handlers for the inbound management channels.
//!
//! Handlers that only touch in-memory resources answer inline. Handlers
//! that start slow work acknowledge first and hand the work to the
//! endpoint's [`WorkerPool`](crate::worker::WorkerPool).

mod action;
mod custom;
mod device_update;
mod firmware;
mod generic;
mod observe;

pub use action::DeviceActionRequestHandler;
pub use custom::{CustomActionHandler, CustomActionRequestHandler, CustomActions};
pub use device_update::DeviceUpdateHandler;
pub use firmware::{FirmwareDownloadHandler, FirmwareUpdateHandler};
pub use generic::GenericHandler;
pub use observe::{CancelHandler, ObserveHandler};

use serde_json::Value;

use crate::envelope::Envelope;

/// One entry of a `d.fields` list.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FieldRef {
    /// Field name, or the raw entry text when `malformed`.
    pub name: String,
    pub value: Option<Value>,
    /// Neither a name nor a `{"field": name}` object.
    pub malformed: bool,
}

impl FieldRef {
    fn named(name: &str, value: Option<Value>) -> Self {
        Self {
            name: name.to_string(),
            value,
            malformed: false,
        }
    }

    fn malformed(entry: &Value) -> Self {
        Self {
            name: entry.to_string(),
            value: None,
            malformed: true,
        }
    }
}

/// Entries of the first list found under one of `keys` in the request data.
///
/// Entries are either `{"field": name, "value": v}` objects or bare names;
/// anything else is kept as a malformed entry. Returns `None` when no such
/// list exists.
pub(crate) fn field_list(request: &Envelope, keys: &[&str]) -> Option<Vec<FieldRef>> {
    let data = request.data_object()?;
    let list = keys.iter().find_map(|k| data.get(*k)?.as_array())?;
    Some(
        list.iter()
            .map(|entry| match entry {
                Value::String(name) => FieldRef::named(name, None),
                Value::Object(obj) => match obj.get("field").and_then(Value::as_str) {
                    Some(name) => FieldRef::named(name, obj.get("value").cloned()),
                    None => FieldRef::malformed(entry),
                },
                _ => FieldRef::malformed(entry),
            })
            .collect(),
    )
}
