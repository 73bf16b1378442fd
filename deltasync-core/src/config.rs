//! Tunables shared by the client state machines and the server coordinator.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Result, SyncError};

/// Sync protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delta entries per push request
    pub push_batch_size: usize,
    /// Delta entries per pull response
    pub pull_batch_size: usize,
    /// Bound on missing-keys and fallback restarts within one push or pull
    pub max_restarts: u32,
    /// Reject pushes whose seqnum does not exceed the current one
    pub enforce_monotonic_seqnum: bool,
    /// Superseded server versions kept around as delta bases
    pub retained_versions: usize,
    /// Partial pushes idle longer than this are dropped
    pub accumulator_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_batch_size: 16,
            pull_batch_size: 16,
            max_restarts: 8,
            enforce_monotonic_seqnum: true,
            retained_versions: 16,
            accumulator_ttl_secs: 300,
        }
    }
}

impl SyncConfig {
    /// Parse from TOML; missing fields fall back to defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml_dep::from_str(content)
            .map_err(|e| SyncError::Config(format!("Invalid sync config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.push_batch_size == 0 || self.pull_batch_size == 0 {
            return Err(SyncError::Config(
                "Batch sizes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
