//! Cryptographic primitives for the sync engine.
//!
//! This module provides:
//! - HKDF-SHA256 key derivation from one shared secret
//! - AES-256-CBC per-record encryption
//! - Content hashing of KEV maps (the version hash)
//! - HMAC-SHA256 signed version pointers
//!
//! Records carry no authentication tag of their own. Integrity comes from
//! the aggregate version hash, so ciphertext must only be decrypted after
//! the enclosing version has been verified.

pub mod cipher;
pub mod kdf;
pub mod keyring;
pub mod verhash;

pub use cipher::{decrypt_record, encrypt_record, Ciphertext};
pub use kdf::derive_key;
pub use keyring::{EncryptionKey, Keyring, SigningKey};
pub use verhash::{
    compute_version_hash, parse_version_pointer, sign_version_pointer, verify_version_pointer,
    SignedVerhash, Verhash, VersionPointer,
};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Integrity check failed: {0}")]
    IntegrityFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
