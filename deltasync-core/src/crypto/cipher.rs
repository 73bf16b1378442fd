//! AES-256-CBC encryption and decryption for individual records.
//!
//! Uses AES-256-CBC with:
//! - 256-bit key
//! - 128-bit (16 byte) random IV per record, prepended to the output
//! - PKCS#7 padding
//!
//! The wire format is `iv(16) || ciphertext`. There is no per-record
//! authentication tag: never call [`decrypt_record`] on ciphertext whose
//! enclosing version hash has not been verified.

use crate::crypto::keyring::EncryptionKey;
use crate::crypto::{CryptoError, Result};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::Rng;
use serde::{Deserialize, Serialize};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// IV length (one AES block)
pub const IV_LEN: usize = 16;

/// An encrypted record value: `iv(16) || ciphertext`.
///
/// Serialized as a standard-alphabet base64 string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ciphertext(#[serde(with = "base64_bytes")] Vec<u8>);

impl Ciphertext {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Encrypt one record with a fresh random IV.
pub fn encrypt_record(key: &EncryptionKey, plaintext: &[u8]) -> Ciphertext {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill(&mut iv);

    let cipher = Aes256CbcEnc::new(key.as_bytes().into(), (&iv).into());
    let body = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + body.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&body);
    Ciphertext(out)
}

/// Decrypt one record.
///
/// Fails with [`CryptoError::CorruptRecord`] when the input is shorter than
/// one IV block or the padding does not check out.
pub fn decrypt_record(key: &EncryptionKey, ciphertext: &Ciphertext) -> Result<Vec<u8>> {
    let bytes = ciphertext.as_bytes();
    if bytes.len() < IV_LEN {
        return Err(CryptoError::CorruptRecord(format!(
            "Record too short: {} bytes",
            bytes.len()
        )));
    }

    let (iv, body) = bytes.split_at(IV_LEN);
    let iv: [u8; IV_LEN] = iv
        .try_into()
        .map_err(|_| CryptoError::CorruptRecord("Invalid IV length".to_string()))?;

    let cipher = Aes256CbcDec::new(key.as_bytes().into(), (&iv).into());
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| CryptoError::CorruptRecord("Invalid block length or padding".to_string()))
}

/// Custom base64 serialization for `Vec<u8>`.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
