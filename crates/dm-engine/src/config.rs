//! Endpoint configuration.
//!
//! Every field has a serde default so partial config files work, and the
//! most commonly tuned knobs can be overridden from the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable names recognised by [`EndpointConfig::with_env_overrides`].
pub mod env_vars {
    pub const RESPONSE_TIMEOUT_MS: &str = "DM_RESPONSE_TIMEOUT_MS";
    pub const MANAGE_TIMEOUT_SECS: &str = "DM_MANAGE_TIMEOUT_SECS";
    pub const QOS: &str = "DM_QOS";
    pub const WORKER_POOL_SIZE: &str = "DM_WORKER_POOL_SIZE";
    pub const DOWNLOAD_DIR: &str = "DM_DOWNLOAD_DIR";
}

/// Reference constants.
pub mod defaults {
    /// Time to wait for a correlated response.
    pub const RESPONSE_TIMEOUT_MS: u64 = 5_000;
    /// Time to wait for the manage response.
    pub const MANAGE_TIMEOUT_SECS: u64 = 120;
    /// Ceiling for a reboot or factory reset to complete.
    pub const ACTION_TIMEOUT_SECS: u64 = 120;
    /// Ceiling for a firmware install to complete.
    pub const INSTALL_TIMEOUT_SECS: u64 = 300;
    /// Process completion poll interval.
    pub const POLL_INTERVAL_MS: u64 = 1_000;
    /// Bytes between progress reports when the content length is unknown.
    pub const PROGRESS_STEP_BYTES: u64 = 64 * 1024;
}

fn default_qos() -> u8 {
    1
}

fn default_response_timeout_ms() -> u64 {
    defaults::RESPONSE_TIMEOUT_MS
}

fn default_manage_timeout_secs() -> u64 {
    defaults::MANAGE_TIMEOUT_SECS
}

fn default_worker_pool_size() -> usize {
    1
}

fn default_worker_queue_capacity() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_action_timeout_secs() -> u64 {
    defaults::ACTION_TIMEOUT_SECS
}

fn default_poll_interval_ms() -> u64 {
    defaults::POLL_INTERVAL_MS
}

fn default_reboot_command() -> Vec<String> {
    if cfg!(windows) {
        vec!["shutdown".into(), "-r".into()]
    } else {
        vec!["sudo".into(), "shutdown".into(), "-r".into(), "now".into()]
    }
}

fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("dm-engine")
}

fn default_install_timeout_secs() -> u64 {
    defaults::INSTALL_TIMEOUT_SECS
}

fn default_install_command() -> Vec<String> {
    vec!["sudo".into(), "dpkg".into(), "-i".into()]
}

fn default_remediation_command() -> Vec<String> {
    vec!["sudo".into(), "apt-get".into(), "-fy".into(), "install".into()]
}

fn default_install_log_name() -> String {
    "install.log".to_string()
}

fn default_progress_step_bytes() -> u64 {
    defaults::PROGRESS_STEP_BYTES
}

/// Device action (reboot / factory reset) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Ceiling for the platform procedure to finish.
    #[serde(default = "default_action_timeout_secs")]
    pub timeout_secs: u64,

    /// Completion poll interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Program and arguments that reboot the host.
    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,

    /// Program and arguments for a factory reset; unsupported when absent.
    #[serde(default)]
    pub factory_reset_command: Option<Vec<String>>,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_action_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            reboot_command: default_reboot_command(),
            factory_reset_command: None,
        }
    }
}

impl ActionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Firmware download / install settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Directory that receives downloaded artifacts and the install log.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Ceiling for one install attempt.
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,

    /// Completion poll interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Install program; the artifact path is appended.
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,

    /// Run once when the install log reports dependency problems.
    #[serde(default = "default_remediation_command")]
    pub remediation_command: Vec<String>,

    /// File name of the install log inside `download_dir`.
    #[serde(default = "default_install_log_name")]
    pub install_log_name: String,

    /// Progress granularity when the content length is unknown.
    #[serde(default = "default_progress_step_bytes")]
    pub progress_step_bytes: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            install_timeout_secs: default_install_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            install_command: default_install_command(),
            remediation_command: default_remediation_command(),
            install_log_name: default_install_log_name(),
            progress_step_bytes: default_progress_step_bytes(),
        }
    }
}

impl FirmwareConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn install_log_path(&self) -> PathBuf {
        self.download_dir.join(&self.install_log_name)
    }
}

/// Configuration of one managed endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Device type identifier.
    #[serde(default)]
    pub type_id: String,

    /// Device identifier.
    #[serde(default)]
    pub device_id: String,

    /// QoS used for every publish.
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Default timeout for correlated responses.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Timeout for the manage request.
    #[serde(default = "default_manage_timeout_secs")]
    pub manage_timeout_secs: u64,

    /// Management lifetime in seconds, 0 for unbounded.
    #[serde(default)]
    pub lifetime_secs: u64,

    /// Advertise reboot / factory reset support.
    #[serde(default = "default_true")]
    pub supports_device_actions: bool,

    /// Advertise firmware download / update support.
    #[serde(default = "default_true")]
    pub supports_firmware_actions: bool,

    /// Workers serving slow operations.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Jobs that may wait for a worker.
    #[serde(default = "default_worker_queue_capacity")]
    pub worker_queue_capacity: usize,

    #[serde(default)]
    pub action: ActionConfig,

    #[serde(default)]
    pub firmware: FirmwareConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            type_id: String::new(),
            device_id: String::new(),
            qos: default_qos(),
            response_timeout_ms: default_response_timeout_ms(),
            manage_timeout_secs: default_manage_timeout_secs(),
            lifetime_secs: 0,
            supports_device_actions: true,
            supports_firmware_actions: true,
            worker_pool_size: default_worker_pool_size(),
            worker_queue_capacity: default_worker_queue_capacity(),
            action: ActionConfig::default(),
            firmware: FirmwareConfig::default(),
        }
    }
}

impl EndpointConfig {
    pub fn new(type_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_manage_timeout(mut self, timeout: Duration) -> Self {
        self.manage_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_lifetime_secs(mut self, lifetime_secs: u64) -> Self {
        self.lifetime_secs = lifetime_secs;
        self
    }

    pub fn with_device_actions(mut self, supported: bool) -> Self {
        self.supports_device_actions = supported;
        self
    }

    pub fn with_firmware_actions(mut self, supported: bool) -> Self {
        self.supports_firmware_actions = supported;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_action(mut self, action: ActionConfig) -> Self {
        self.action = action;
        self
    }

    pub fn with_firmware(mut self, firmware: FirmwareConfig) -> Self {
        self.firmware = firmware;
        self
    }

    /// Apply overrides from [`env_vars`].
    pub fn with_env_overrides(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.parse().ok())
        }

        if let Some(v) = parsed(env_vars::RESPONSE_TIMEOUT_MS) {
            self.response_timeout_ms = v;
        }
        if let Some(v) = parsed(env_vars::MANAGE_TIMEOUT_SECS) {
            self.manage_timeout_secs = v;
        }
        if let Some(v) = parsed(env_vars::QOS) {
            self.qos = v;
        }
        if let Some(v) = parsed(env_vars::WORKER_POOL_SIZE) {
            self.worker_pool_size = v;
        }
        if let Ok(dir) = std::env::var(env_vars::DOWNLOAD_DIR) {
            self.firmware.download_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn manage_timeout(&self) -> Duration {
        Duration::from_secs(self.manage_timeout_secs)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.qos > 2 {
            return Err(Error::Config(format!("qos must be 0..=2, got {}", self.qos)));
        }
        if self.worker_pool_size == 0 {
            return Err(Error::Config("worker_pool_size must be at least 1".into()));
        }
        if self.worker_queue_capacity == 0 {
            return Err(Error::Config("worker_queue_capacity must be at least 1".into()));
        }
        if self.action.poll_interval_ms == 0 || self.firmware.poll_interval_ms == 0 {
            return Err(Error::Config("poll intervals must be non-zero".into()));
        }
        if self.firmware.install_command.is_empty() {
            return Err(Error::Config("firmware.install_command is empty".into()));
        }
        Ok(())
    }
}
