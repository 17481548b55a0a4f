//! Update engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, UpdateError};
use crate::image::HeaderMode;
use crate::policy::VersionMode;

/// Largest image accepted by default (1 MiB)
pub const DEFAULT_MAX_IMAGE_SIZE: u64 = 1024 * 1024;

/// Default scratch buffer, which bounds each transport read
pub const DEFAULT_SCRATCH_SIZE: usize = 8192;

/// The single storage root uploads may target
pub const DEFAULT_STORAGE_ROOT: &str = "/spiffs";

/// Configuration for [`crate::engine::UpdateEngine`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Ceiling on the declared upload length in bytes
    pub max_image_size: u64,

    /// Scratch buffer size in bytes
    pub scratch_size: usize,

    /// Storage root an upload must name
    pub storage_root: String,

    /// Header extraction behavior
    pub header_mode: HeaderMode,

    /// Version policy enforcement
    pub version_mode: VersionMode,

    /// Abort when the transport stalls this long; unset retries forever
    pub receive_deadline_ms: Option<u64>,

    /// Capacity of the progress broadcast channel
    pub progress_capacity: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            scratch_size: DEFAULT_SCRATCH_SIZE,
            storage_root: DEFAULT_STORAGE_ROOT.to_string(),
            header_mode: HeaderMode::default(),
            version_mode: VersionMode::default(),
            receive_deadline_ms: None,
            progress_capacity: 64,
        }
    }
}

impl UpdateConfig {
    /// Check the configuration for values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_image_size == 0 {
            return Err(UpdateError::Config(
                "max_image_size must be greater than zero".to_string(),
            ));
        }
        if self.scratch_size == 0 {
            return Err(UpdateError::Config(
                "scratch_size must be greater than zero".to_string(),
            ));
        }
        if !self.storage_root.starts_with('/') {
            return Err(UpdateError::Config(format!(
                "storage_root must be absolute, got '{}'",
                self.storage_root
            )));
        }
        if self.progress_capacity == 0 {
            return Err(UpdateError::Config(
                "progress_capacity must be greater than zero".to_string(),
            ));
        }
        if self.receive_deadline_ms == Some(0) {
            return Err(UpdateError::Config(
                "receive_deadline_ms must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Receive deadline as a duration
    pub fn receive_deadline(&self) -> Option<Duration> {
        self.receive_deadline_ms.map(Duration::from_millis)
    }

    /// Parse and validate a JSON configuration
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the text does not parse or fails validation.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: UpdateConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Io`] if the file cannot be read and
    /// [`UpdateError::Config`] if it does not parse or validate.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_json(&content)?;
        debug!("Loaded update config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a JSON file
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Io`] if the file or its directory cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        debug!("Saved update config to {:?}", path);
        Ok(())
    }
}
