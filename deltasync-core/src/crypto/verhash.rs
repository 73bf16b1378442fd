//! Version hashing and signed version pointers.
//!
//! The version hash is a SHA-256 digest over a KEV map. Keys are visited in
//! ascending byte order and each entry is fed as
//!
//! ```text
//! u64_be(len(key)) || key || SHA256(ciphertext)
//! ```
//!
//! so no two distinct maps can produce the same byte stream.
//!
//! A signed pointer authenticates `{seqnum, verhash}` with HMAC-SHA256:
//!
//! ```text
//! {seqnum}:{verhash}:{base64(HMAC(sign_key, "{seqnum}:{verhash}"))}
//! ```

use crate::crypto::cipher::Ciphertext;
use crate::crypto::keyring::SigningKey;
use crate::crypto::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex digest of a KEV map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Verhash(String);

impl Verhash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Verhash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Verhash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for Verhash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `{seqnum}:{verhash}:{mac}` token.
///
/// Clients produce and verify these; the relay only ever parses them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignedVerhash(String);

impl SignedVerhash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SignedVerhash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SignedVerhash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SignedVerhash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `{seqnum, verhash}` pair carried by a signed pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPointer {
    pub seqnum: u64,
    pub verhash: Verhash,
}

/// Compute the content hash of a KEV map.
///
/// `BTreeMap` iterates in ascending key order, which makes the digest
/// independent of insertion order.
pub fn compute_version_hash(kevs: &BTreeMap<String, Ciphertext>) -> Verhash {
    let mut hasher = Sha256::new();
    for (key, ciphertext) in kevs {
        let key_bytes = key.as_bytes();
        hasher.update((key_bytes.len() as u64).to_be_bytes());
        hasher.update(key_bytes);
        hasher.update(Sha256::digest(ciphertext.as_bytes()));
    }
    Verhash(hex::encode(hasher.finalize()))
}

fn canonical_pointer(seqnum: u64, verhash: &Verhash) -> String {
    format!("{}:{}", seqnum, verhash)
}

fn pointer_mac(sign_key: &SigningKey, canonical: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(sign_key.as_bytes()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: 32,
            got: sign_key.as_bytes().len(),
        }
    })?;
    mac.update(canonical.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sign `{seqnum, verhash}` with the shared signing key.
pub fn sign_version_pointer(
    sign_key: &SigningKey,
    seqnum: u64,
    verhash: &Verhash,
) -> Result<SignedVerhash> {
    let canonical = canonical_pointer(seqnum, verhash);
    let tag = pointer_mac(sign_key, &canonical)?;
    Ok(SignedVerhash(format!("{}:{}", canonical, STANDARD.encode(tag))))
}

/// Split a signed pointer into its three fields without checking the MAC.
fn split_pointer(signed: &SignedVerhash) -> Result<(VersionPointer, &str)> {
    let parts: Vec<&str> = signed.as_str().split(':').collect();
    if parts.len() != 3 {
        return Err(CryptoError::IntegrityFailed(format!(
            "Signed pointer has {} fields, expected 3",
            parts.len()
        )));
    }

    let seqnum: u64 = parts[0]
        .parse()
        .map_err(|_| CryptoError::IntegrityFailed("Invalid seqnum in pointer".to_string()))?;
    if parts[1].is_empty() {
        return Err(CryptoError::IntegrityFailed("Empty verhash in pointer".to_string()));
    }

    Ok((
        VersionPointer {
            seqnum,
            verhash: Verhash(parts[1].to_string()),
        },
        parts[2],
    ))
}

/// Verify a signed pointer and return the pointer it authenticates.
///
/// Uses constant-time comparison of the MAC.
pub fn verify_version_pointer(sign_key: &SigningKey, signed: &SignedVerhash) -> Result<VersionPointer> {
    let (pointer, encoded_mac) = split_pointer(signed)?;
    let provided = STANDARD
        .decode(encoded_mac)
        .map_err(|_| CryptoError::IntegrityFailed("Invalid MAC encoding".to_string()))?;

    let expected = pointer_mac(sign_key, &canonical_pointer(pointer.seqnum, &pointer.verhash))?;
    if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
        Ok(pointer)
    } else {
        Err(CryptoError::IntegrityFailed("Pointer MAC mismatch".to_string()))
    }
}

/// Parse a signed pointer without verifying it.
///
/// This is all the relay can do, since it never holds the signing key.
pub fn parse_version_pointer(signed: &SignedVerhash) -> Result<VersionPointer> {
    split_pointer(signed).map(|(pointer, _)| pointer)
}
