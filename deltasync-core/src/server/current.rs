//! The compare-and-swap "current version" slot.

use crate::crypto::Verhash;
use crate::versions::ServerVersion;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Result of [`CurrentVersion::update_version`].
#[derive(Debug)]
pub enum CasOutcome {
    /// The new version is installed; `previous` is what it replaced.
    Installed {
        previous: Option<Arc<ServerVersion>>,
    },
    /// The expected verhash did not match; the slot is unchanged.
    Conflict {
        current: Option<Arc<ServerVersion>>,
    },
}

/// Single mutable pointer to the dataset's current version.
#[derive(Debug, Default)]
pub struct CurrentVersion {
    slot: RwLock<Option<Arc<ServerVersion>>>,
}

impl CurrentVersion {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<Arc<ServerVersion>> {
        self.slot.read().await.clone()
    }

    /// Install `new_version` iff the slot's verhash equals `expected_old`.
    ///
    /// `None` matches only an empty slot.
    pub async fn update_version(
        &self,
        expected_old: Option<&Verhash>,
        new_version: Arc<ServerVersion>,
    ) -> CasOutcome {
        let mut slot = self.slot.write().await;
        let matches = slot.as_ref().map(|v| v.verhash()) == expected_old;
        if !matches {
            debug!("CAS conflict installing {}", new_version.verhash());
            return CasOutcome::Conflict {
                current: slot.clone(),
            };
        }
        let previous = slot.replace(new_version);
        CasOutcome::Installed { previous }
    }

    /// Install unconditionally, returning what was there.
    pub async fn replace_version(
        &self,
        new_version: Arc<ServerVersion>,
    ) -> Option<Arc<ServerVersion>> {
        self.slot.write().await.replace(new_version)
    }
}
