//! Key material shared by all devices of one dataset.
//!
//! Shared secret → HKDF → { encryption key, signing key }
//!
//! The relay never holds a `Keyring`. Server-side types take no key at all,
//! so the server can parse signed pointers but has no way to verify them.

use crate::crypto::kdf::{derive_key, ENC_LABEL, SIGN_LABEL};
use crate::crypto::Result;
use zeroize::ZeroizeOnDrop;

/// AES-256 key used for per-record encryption
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    /// Create an encryption key from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Get a reference to the key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// HMAC-SHA256 key used to sign version pointers
#[derive(Clone, ZeroizeOnDrop)]
pub struct SigningKey {
    key: [u8; 32],
}

impl SigningKey {
    /// Create a signing key from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Get a reference to the key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// The pair of keys every client-side cryptographic operation needs.
#[derive(Clone)]
pub struct Keyring {
    enc_key: EncryptionKey,
    sign_key: SigningKey,
}

impl Keyring {
    /// Build a keyring from already-derived keys
    pub fn new(enc_key: EncryptionKey, sign_key: SigningKey) -> Self {
        Self { enc_key, sign_key }
    }

    /// Derive both keys from one shared passphrase
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let enc_key = EncryptionKey::from_bytes(derive_key(secret, ENC_LABEL)?);
        let sign_key = SigningKey::from_bytes(derive_key(secret, SIGN_LABEL)?);
        Ok(Self { enc_key, sign_key })
    }

    pub fn enc_key(&self) -> &EncryptionKey {
        &self.enc_key
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Keyring { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyring_from_secret() {
        let keyring = Keyring::from_secret(b"correct horse battery staple").unwrap();
        assert_ne!(keyring.enc_key().as_bytes(), keyring.sign_key().as_bytes());

        let again = Keyring::from_secret(b"correct horse battery staple").unwrap();
        assert_eq!(keyring.enc_key().as_bytes(), again.enc_key().as_bytes());
        assert_eq!(keyring.sign_key().as_bytes(), again.sign_key().as_bytes());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let keyring = Keyring::from_secret(b"secret").unwrap();
        assert_eq!(format!("{:?}", keyring), "Keyring { .. }");
    }
}
