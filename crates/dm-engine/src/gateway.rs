//! Gateway managing several attached devices.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::endpoint::{ManagedEndpoint, ManagedEndpointBuilder};
use crate::error::{Error, Result};
use crate::worker::WorkerPool;

/// Key of an attached device.
pub type DeviceKey = (String, String);

/// Endpoints of a gateway sharing one worker pool.
///
/// Each endpoint talks through its own transport, which addresses that
/// device's topics, e.g. an MQTT transport with a gateway topic scheme.
pub struct ManagedGateway {
    pool: Arc<WorkerPool>,
    endpoints: DashMap<DeviceKey, Arc<ManagedEndpoint>>,
}

impl ManagedGateway {
    /// Create a gateway whose pool has `workers` workers and room for
    /// `queue_capacity` waiting jobs.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(name: impl Into<String>, workers: usize, queue_capacity: usize) -> Self {
        Self {
            pool: Arc::new(WorkerPool::new(name, workers, queue_capacity)),
            endpoints: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Build an endpoint on the shared pool and attach it.
    pub fn attach(&self, builder: ManagedEndpointBuilder) -> Result<Arc<ManagedEndpoint>> {
        let key = (
            builder.config().type_id.clone(),
            builder.config().device_id.clone(),
        );
        match self.endpoints.entry(key) {
            Entry::Occupied(entry) => {
                let (type_id, device_id) = entry.key();
                Err(Error::InvalidState(format!(
                    "device {}:{} is already attached",
                    type_id, device_id
                )))
            }
            Entry::Vacant(entry) => {
                let endpoint = Arc::new(builder.worker_pool(self.pool.clone()).build()?);
                entry.insert(endpoint.clone());
                Ok(endpoint)
            }
        }
    }

    /// Detach a device. The endpoint is not unmanaged.
    pub fn detach(&self, type_id: &str, device_id: &str) -> Option<Arc<ManagedEndpoint>> {
        self.endpoints
            .remove(&(type_id.to_string(), device_id.to_string()))
            .map(|(_, endpoint)| endpoint)
    }

    pub fn endpoint(&self, type_id: &str, device_id: &str) -> Option<Arc<ManagedEndpoint>> {
        self.endpoints
            .get(&(type_id.to_string(), device_id.to_string()))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn endpoints(&self) -> Vec<Arc<ManagedEndpoint>> {
        self.endpoints.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Manage every attached device. All are attempted; the first error is
    /// returned.
    pub async fn manage_all(&self) -> Result<()> {
        let mut first_error = None;
        for endpoint in self.endpoints() {
            if let Err(e) = endpoint.manage().await {
                warn!(
                    type_id = endpoint.type_id(),
                    device = endpoint.device_id(),
                    "manage failed: {}",
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(devices = self.len(), "gateway devices managed");
                Ok(())
            }
        }
    }

    pub async fn unmanage_all(&self) -> Result<()> {
        let mut first_error = None;
        for endpoint in self.endpoints() {
            if let Err(e) = endpoint.unmanage().await {
                warn!(device = endpoint.device_id(), "unmanage failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop accepting work. Running operations still finish.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
