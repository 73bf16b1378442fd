//! Encrypted Key-Value Sync Core Library
//!
//! Each device holds an encrypted, content-addressed snapshot ("Version") of
//! a shared key-value dataset. Devices converge through a relay that only
//! ever sees ciphertext, exchanging batched deltas guarded by a signed
//! version hash and a compare-and-swap "current version" pointer.

pub mod client;
pub mod config;
pub mod crypto;
pub mod server;
pub mod transfer;
pub mod versions;

pub use client::{Device, DeviceEvent, Merge, TheirsWins};
pub use config::SyncConfig;
pub use crypto::{CryptoError, Keyring, SignedVerhash, Verhash, VersionPointer};
pub use server::{CurrentVersion, Server};
pub use transfer::{pull, push, LoopbackTransport, PullOutcome, PushOutcome, Transport};
pub use versions::{KevMap, KvMap, NewVersion, Version, VersionStore};

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// General error type for sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Hash or signature mismatch. The version attempt is dead; re-fetch.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Malformed ciphertext
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// The peer answered with something the protocol does not allow here
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport failed; no retry is attempted by the protocol layer
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for SyncError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::IntegrityFailed(msg) => Self::Integrity(msg),
            CryptoError::CorruptRecord(msg) => Self::CorruptRecord(msg),
            other => Self::Crypto(other),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
