//! Firmware image installation.

use std::path::Path;

use async_trait::async_trait;

use crate::config::FirmwareConfig;
use crate::process::{run_bounded, OutputTarget, ProcessOutcome};

/// Install log line written when package dependencies are missing.
pub const DEPENDENCY_ERROR_MARKER: &str = "dependency problems - leaving unconfigured";

/// Install log line written when the package could not be installed.
pub const GENERIC_ERROR_MARKER: &str = "Errors were encountered while processing";

/// Installs a downloaded firmware image.
#[async_trait]
pub trait FirmwareInstaller: Send + Sync {
    /// Install `artifact`, writing output to `log`.
    async fn install(&self, artifact: &Path, log: &Path) -> ProcessOutcome;

    /// Repair after a dependency error, appending output to `log`.
    async fn remediate(&self, log: &Path) -> ProcessOutcome;
}

/// What an install attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallVerdict {
    Success,
    DependencyError,
    GenericError,
    Failed(String),
}

/// Judge an install attempt by its log first and its exit status second.
pub fn classify(outcome: &ProcessOutcome, log: &str) -> InstallVerdict {
    if log.contains(DEPENDENCY_ERROR_MARKER) {
        InstallVerdict::DependencyError
    } else if log.contains(GENERIC_ERROR_MARKER) {
        InstallVerdict::GenericError
    } else if outcome.is_success() {
        InstallVerdict::Success
    } else {
        InstallVerdict::Failed(outcome.describe())
    }
}

/// Installs with the configured package manager commands.
pub struct CommandInstaller {
    config: FirmwareConfig,
}

impl CommandInstaller {
    pub fn new(config: FirmwareConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FirmwareInstaller for CommandInstaller {
    async fn install(&self, artifact: &Path, log: &Path) -> ProcessOutcome {
        let Some(artifact) = artifact.to_str() else {
            return ProcessOutcome::Failed(format!("non UTF-8 path {}", artifact.display()));
        };
        run_bounded(
            &self.config.install_command,
            &[artifact],
            OutputTarget::File(log),
            self.config.install_timeout(),
            self.config.poll_interval(),
        )
        .await
    }

    async fn remediate(&self, log: &Path) -> ProcessOutcome {
        run_bounded(
            &self.config.remediation_command,
            &[],
            OutputTarget::File(log),
            self.config.install_timeout(),
            self.config.poll_interval(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(success: bool) -> ProcessOutcome {
        ProcessOutcome::Exited {
            success,
            code: Some(if success { 0 } else { 1 }),
            output: String::new(),
        }
    }

    #[test]
    fn test_log_markers_take_precedence() {
        let log = format!("Setting up...\n{}\n{}: fw.deb\n", DEPENDENCY_ERROR_MARKER, GENERIC_ERROR_MARKER);
        assert_eq!(classify(&exited(false), &log), InstallVerdict::DependencyError);
        let log = format!("{}: fw.deb\n", GENERIC_ERROR_MARKER);
        assert_eq!(classify(&exited(true), &log), InstallVerdict::GenericError);
    }

    #[test]
    fn test_exit_status_without_markers() {
        assert_eq!(classify(&exited(true), "ok"), InstallVerdict::Success);
        assert!(matches!(
            classify(&ProcessOutcome::TimedOut, ""),
            InstallVerdict::Failed(_)
        ));
    }
}
