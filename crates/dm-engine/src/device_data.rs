//! Resource tree of one managed endpoint.

use std::sync::Arc;

use dashmap::DashMap;

use crate::resource::{
    names, DeviceFirmware, DeviceInfo, DeviceLocation, DiagnosticLog, ErrorCodes, ManagedResource,
    Metadata, Resource,
};

/// All resources owned by one endpoint, addressable by canonical name.
pub struct DeviceData {
    type_id: String,
    device_id: String,
    location: Arc<Resource<DeviceLocation>>,
    device_info: Arc<Resource<DeviceInfo>>,
    metadata: Arc<Resource<Metadata>>,
    firmware: Option<Arc<Resource<DeviceFirmware>>>,
    error_codes: Arc<Resource<ErrorCodes>>,
    log: Arc<Resource<DiagnosticLog>>,
    index: DashMap<String, Arc<dyn ManagedResource>>,
}

impl DeviceData {
    pub fn builder(type_id: impl Into<String>, device_id: impl Into<String>) -> DeviceDataBuilder {
        DeviceDataBuilder {
            type_id: type_id.into(),
            device_id: device_id.into(),
            location: DeviceLocation::default(),
            device_info: DeviceInfo::default(),
            metadata: Metadata::default(),
            firmware: None,
        }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn location(&self) -> &Arc<Resource<DeviceLocation>> {
        &self.location
    }

    pub fn device_info(&self) -> &Arc<Resource<DeviceInfo>> {
        &self.device_info
    }

    pub fn metadata(&self) -> &Arc<Resource<Metadata>> {
        &self.metadata
    }

    /// Firmware resource, absent when the endpoint has no firmware support.
    pub fn firmware(&self) -> Option<&Arc<Resource<DeviceFirmware>>> {
        self.firmware.as_ref()
    }

    pub fn error_codes(&self) -> &Arc<Resource<ErrorCodes>> {
        &self.error_codes
    }

    pub fn log(&self) -> &Arc<Resource<DiagnosticLog>> {
        &self.log
    }

    /// Look a resource up by canonical name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ManagedResource>> {
        self.index.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Make an application-defined resource addressable.
    pub fn register(&self, resource: Arc<dyn ManagedResource>) {
        self.index.insert(resource.name().to_string(), resource);
    }

    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Builder for [`DeviceData`].
pub struct DeviceDataBuilder {
    type_id: String,
    device_id: String,
    location: DeviceLocation,
    device_info: DeviceInfo,
    metadata: Metadata,
    firmware: Option<DeviceFirmware>,
}

impl DeviceDataBuilder {
    pub fn location(mut self, location: DeviceLocation) -> Self {
        self.location = location;
        self
    }

    pub fn device_info(mut self, device_info: DeviceInfo) -> Self {
        self.device_info = device_info;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn firmware(mut self, firmware: DeviceFirmware) -> Self {
        self.firmware = Some(firmware);
        self
    }

    pub fn build(self) -> DeviceData {
        let location = Arc::new(
            Resource::new(names::LOCATION, self.location).with_response_required(true),
        );
        let device_info = Arc::new(Resource::new(names::DEVICE_INFO, self.device_info));
        let metadata = Arc::new(Resource::new(names::METADATA, self.metadata));
        let firmware = self
            .firmware
            .map(|fw| Arc::new(Resource::new(names::FIRMWARE, fw)));
        let error_codes = Arc::new(
            Resource::new(names::ERROR_CODES, ErrorCodes::default()).with_response_required(true),
        );
        let log = Arc::new(
            Resource::new(names::LOG, DiagnosticLog::default()).with_response_required(true),
        );

        let index: DashMap<String, Arc<dyn ManagedResource>> = DashMap::new();
        index.insert(names::LOCATION.into(), location.clone());
        index.insert(names::DEVICE_INFO.into(), device_info.clone());
        index.insert(names::METADATA.into(), metadata.clone());
        index.insert(names::ERROR_CODES.into(), error_codes.clone());
        index.insert(names::LOG.into(), log.clone());
        if let Some(fw) = &firmware {
            index.insert(names::FIRMWARE.into(), fw.clone());
        }

        DeviceData {
            type_id: self.type_id,
            device_id: self.device_id,
            location,
            device_info,
            metadata,
            firmware,
            error_codes,
            log,
            index,
        }
    }
}
