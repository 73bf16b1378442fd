//! Immutable, content-addressed snapshots of the dataset.
//!
//! A `Version` is only ever produced by closing a builder, which computes
//! the version hash over the KEV map and, for inbound builders, checks it
//! against the hash bound from a signed pointer. There are two variants:
//!
//! - [`client`]: holds plaintext KV and ciphertext KEV maps plus a keyring,
//!   so it can encrypt, decrypt, sign and verify.
//! - [`server`]: holds KEV only and takes no key material; it parses signed
//!   pointers but cannot check them.

pub mod client;
pub mod delta;
pub mod server;

pub use client::{NewVersion, Version, VersionStore};
pub use delta::{apply_delta, compute_delta, DeltaEntry, DeltaOp};
pub use server::{ServerNewVersion, ServerVersion, ServerVersionStore};

use crate::crypto::Ciphertext;
use std::collections::BTreeMap;

/// Plaintext key -> JSON value map.
pub type KvMap = BTreeMap<String, serde_json::Value>;

/// Key -> ciphertext map. The only form the relay ever sees.
pub type KevMap = BTreeMap<String, Ciphertext>;
