//! Relay storage model types.

use deltasync_core::{KevMap, SignedVerhash};

/// The persisted current version.
#[derive(Debug, Clone)]
pub struct StoredVersion {
    pub pointer: SignedVerhash,
    pub seqnum: u64,
    pub saved_at: i64,
    pub kevs: KevMap,
}
