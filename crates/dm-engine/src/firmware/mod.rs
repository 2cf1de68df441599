//! Firmware lifecycle.
//!
//! ```text
//! IDLE -> DOWNLOADING -> DOWNLOADED -> UPDATING -> IDLE
//!              \-> IDLE (failure)
//! ```
//!
//! The state machine owns the `state` and `updateStatus` fields of the
//! firmware resource. Every transition is reported to the server: through
//! the observation when `mgmt.firmware` is observed, as a direct
//! notification otherwise.

mod download;
mod install;

pub use download::{DownloadProgress, FirmwareDownloader, FirmwareFailure, ProgressTracker};
#[cfg(feature = "http")]
pub use download::HttpDownloader;
pub use install::{
    classify, CommandInstaller, FirmwareInstaller, InstallVerdict, DEPENDENCY_ERROR_MARKER,
    GENERIC_ERROR_MARKER,
};

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::channel::ManagementChannel;
use crate::config::FirmwareConfig;
use crate::error::{Error, Result};
use crate::notifier::ChangeNotifier;
use crate::observation::{fields_payload, ObservationRegistry};
use crate::resource::{
    names, DeviceFirmware, DeviceInfo, FirmwareState, FirmwareUpdateStatus, LogEntry, LogSeverity,
    Resource,
};

/// Hex SHA-256 digest of a file.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// File name for a downloaded image: the firmware name, or a timestamped default.
pub fn artifact_name(firmware: &DeviceFirmware) -> String {
    firmware
        .name
        .as_deref()
        .map(str::trim)
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("firmware_{}.bin", chrono::Utc::now().timestamp_millis()))
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "could not remove: {}", e),
    }
}

/// Drives one endpoint's firmware resource through download and install.
pub struct FirmwareStateMachine {
    resource: Arc<Resource<DeviceFirmware>>,
    device_info: Arc<Resource<DeviceInfo>>,
    notifier: Arc<ChangeNotifier>,
    observations: Option<Arc<ObservationRegistry>>,
    downloader: Arc<dyn FirmwareDownloader>,
    installer: Arc<dyn FirmwareInstaller>,
    config: FirmwareConfig,
    artifact: Mutex<Option<PathBuf>>,
}

impl FirmwareStateMachine {
    pub fn new(
        resource: Arc<Resource<DeviceFirmware>>,
        device_info: Arc<Resource<DeviceInfo>>,
        notifier: Arc<ChangeNotifier>,
        downloader: Arc<dyn FirmwareDownloader>,
        installer: Arc<dyn FirmwareInstaller>,
        config: FirmwareConfig,
    ) -> Self {
        Self {
            resource,
            device_info,
            notifier,
            observations: None,
            downloader,
            installer,
            config,
            artifact: Mutex::new(None),
        }
    }

    /// Report through `registry` while it observes the firmware resource.
    pub fn with_observations(mut self, registry: Arc<ObservationRegistry>) -> Self {
        self.observations = Some(registry);
        self
    }

    pub fn resource(&self) -> &Arc<Resource<DeviceFirmware>> {
        &self.resource
    }

    pub fn state(&self) -> FirmwareState {
        self.resource.read(|fw| fw.state)
    }

    pub fn update_status(&self) -> FirmwareUpdateStatus {
        self.resource.read(|fw| fw.update_status)
    }

    /// Path of the downloaded image awaiting installation.
    pub fn artifact(&self) -> Option<PathBuf> {
        self.artifact.lock().clone()
    }

    /// IDLE -> DOWNLOADING. Fails without side effects when not IDLE or no
    /// URL is set.
    pub fn begin_download(&self) -> Result<()> {
        let (_, value) = self.resource.try_local_update(|fw| {
            if fw.state != FirmwareState::Idle {
                return Err(Error::InvalidState(format!(
                    "firmware state is {:?}, expected Idle",
                    fw.state
                )));
            }
            if fw.download_url().is_none() {
                return Err(Error::InvalidState("firmware URL is not set".into()));
            }
            fw.state = FirmwareState::Downloading;
            fw.update_status = FirmwareUpdateStatus::InProgress;
            Ok(())
        })?;
        self.report(value);
        Ok(())
    }

    /// Run a download started with [`begin_download`](Self::begin_download).
    ///
    /// Always leaves the machine in DOWNLOADED or IDLE.
    pub async fn run_download(&self) -> FirmwareUpdateStatus {
        let firmware = self.resource.get();
        let result = match firmware.download_url() {
            Some(url) => {
                let dest = self.config.download_dir.join(artifact_name(&firmware));
                let fetched = AssertUnwindSafe(self.fetch(url, &dest, firmware.verifier.as_deref()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(FirmwareFailure::connection_lost("download panicked")));
                if fetched.is_err() {
                    remove_quietly(&dest).await;
                }
                fetched.map(|()| dest)
            }
            None => Err(FirmwareFailure::invalid_uri("firmware URL is not set")),
        };

        match result {
            Ok(dest) => {
                info!(path = %dest.display(), "firmware downloaded");
                *self.artifact.lock() = Some(dest);
                self.transition(|fw| {
                    fw.state = FirmwareState::Downloaded;
                    fw.update_status = FirmwareUpdateStatus::Success;
                });
                FirmwareUpdateStatus::Success
            }
            Err(failure) => {
                warn!(status = ?failure.status, "firmware download failed: {}", failure.message);
                self.transition(|fw| {
                    fw.state = FirmwareState::Idle;
                    fw.update_status = failure.status;
                });
                failure.status
            }
        }
    }

    /// Download and verify the image described by the firmware resource.
    pub async fn download_firmware(&self) -> Result<FirmwareUpdateStatus> {
        self.begin_download()?;
        Ok(self.run_download().await)
    }

    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        verifier: Option<&str>,
    ) -> std::result::Result<(), FirmwareFailure> {
        tokio::fs::create_dir_all(&self.config.download_dir)
            .await
            .map_err(|e| FirmwareFailure::out_of_memory(e.to_string()))?;

        let notifier = self.notifier.clone();
        let progress = move |report: DownloadProgress| {
            let entry = LogEntry::new(report.message(), LogSeverity::Informational);
            if let Ok(data) = serde_json::to_value(&entry) {
                notifier.enqueue(ManagementChannel::AddLog, data);
            }
        };
        self.downloader.download(url, dest, &progress).await?;

        if let Some(expected) = verifier.map(str::trim).filter(|v| !v.is_empty()) {
            let actual = sha256_file(dest)
                .await
                .map_err(|e| FirmwareFailure::out_of_memory(e.to_string()))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FirmwareFailure::new(
                    FirmwareUpdateStatus::VerificationFailed,
                    format!("checksum mismatch: expected {}, got {}", expected, actual),
                ));
            }
        }
        Ok(())
    }

    /// DOWNLOADED -> UPDATING. Fails without side effects otherwise.
    pub fn begin_update(&self) -> Result<()> {
        if self.artifact.lock().is_none() {
            return Err(Error::InvalidState("no downloaded firmware image".into()));
        }
        let (_, value) = self.resource.try_local_update(|fw| {
            if fw.state != FirmwareState::Downloaded {
                return Err(Error::InvalidState(format!(
                    "firmware state is {:?}, expected Downloaded",
                    fw.state
                )));
            }
            fw.state = FirmwareState::Updating;
            fw.update_status = FirmwareUpdateStatus::InProgress;
            Ok(())
        })?;
        self.report(value);
        Ok(())
    }

    /// Run an install started with [`begin_update`](Self::begin_update).
    ///
    /// The image and install log are deleted whatever the outcome.
    pub async fn run_update(&self) -> FirmwareUpdateStatus {
        let artifact = self.artifact.lock().clone();
        let log = self.config.install_log_path();

        let status = match &artifact {
            Some(artifact) => AssertUnwindSafe(self.install(artifact, &log))
                .catch_unwind()
                .await
                .unwrap_or(FirmwareUpdateStatus::UnsupportedImage),
            None => FirmwareUpdateStatus::UnsupportedImage,
        };

        if let Some(artifact) = &artifact {
            remove_quietly(artifact).await;
        }
        remove_quietly(&log).await;
        *self.artifact.lock() = None;

        let success = status == FirmwareUpdateStatus::Success;
        if success {
            if let Some(version) = self.resource.read(|fw| fw.version.clone()) {
                self.device_info
                    .apply_local_update(|info| info.fw_version = Some(version));
            }
            info!("firmware installed");
        } else {
            warn!(status = ?status, "firmware install failed");
        }
        self.transition(|fw| {
            fw.state = FirmwareState::Idle;
            fw.update_status = status;
            if success {
                fw.verifier = None;
            }
        });
        status
    }

    /// Install the previously downloaded image.
    pub async fn update_firmware(&self) -> Result<FirmwareUpdateStatus> {
        self.begin_update()?;
        Ok(self.run_update().await)
    }

    async fn install(&self, artifact: &Path, log: &Path) -> FirmwareUpdateStatus {
        let outcome = self.installer.install(artifact, log).await;
        let text = tokio::fs::read_to_string(log).await.unwrap_or_default();
        match classify(&outcome, &text) {
            InstallVerdict::Success => FirmwareUpdateStatus::Success,
            InstallVerdict::DependencyError => {
                warn!("install reported dependency problems, running remediation");
                let fixed = self.installer.remediate(log).await;
                if fixed.is_success() {
                    FirmwareUpdateStatus::Success
                } else {
                    warn!("remediation failed: {}", fixed.describe());
                    FirmwareUpdateStatus::UnsupportedImage
                }
            }
            InstallVerdict::GenericError => FirmwareUpdateStatus::UnsupportedImage,
            InstallVerdict::Failed(reason) => {
                warn!("install failed: {}", reason);
                FirmwareUpdateStatus::UnsupportedImage
            }
        }
    }

    /// Return to IDLE after work could not be scheduled.
    pub async fn abandon(&self, status: FirmwareUpdateStatus) {
        let artifact = self.artifact.lock().take();
        if let Some(artifact) = artifact {
            remove_quietly(&artifact).await;
        }
        self.transition(|fw| {
            fw.state = FirmwareState::Idle;
            fw.update_status = status;
        });
    }

    fn transition(&self, f: impl FnOnce(&mut DeviceFirmware)) {
        let value = self.resource.apply_local_update(f);
        self.report(value);
    }

    fn report(&self, value: Value) {
        let observed = self
            .observations
            .as_ref()
            .is_some_and(|registry| registry.is_observed(names::FIRMWARE));
        if !observed {
            self.notifier
                .enqueue(ManagementChannel::Notify, fields_payload(names::FIRMWARE, value));
        }
    }
}
