//! Server-side versions: ciphertext only, no key material.
//!
//! The relay receives signed pointers from clients and keeps them verbatim
//! so it can hand them back out, but it can only parse them. Closing a
//! server build still checks the version hash, which guards against
//! transmission errors and truncated pushes.

use crate::crypto::{compute_version_hash, parse_version_pointer, Ciphertext, SignedVerhash, Verhash};
use crate::versions::delta::{compute_delta, DeltaEntry, DeltaOp};
use crate::versions::KevMap;
use crate::{Result, SyncError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::debug;

type Registry = RwLock<HashMap<Verhash, Arc<ServerVersion>>>;

/// Registry of the versions one dataset's relay still remembers.
#[derive(Clone, Default)]
pub struct ServerVersionStore {
    versions: Arc<Registry>,
}

impl ServerVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a full-snapshot build for `signed`.
    pub fn create_new_version(&self, signed: &SignedVerhash) -> Result<ServerNewVersion> {
        ServerNewVersion::new(Arc::downgrade(&self.versions), signed, KevMap::new())
    }

    pub fn get_version(&self, verhash: &Verhash) -> Option<Arc<ServerVersion>> {
        let versions = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        versions.get(verhash).cloned()
    }

    /// Evict `version`. An equal-content version registered separately
    /// under the same verhash is left alone.
    pub fn free(&self, version: &ServerVersion) {
        let mut versions = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        let registered = versions
            .get(version.verhash())
            .is_some_and(|v| std::ptr::eq(v.as_ref(), version));
        if registered {
            versions.remove(version.verhash());
            debug!("Freed server version {}", version.verhash());
        }
    }

    /// Make `version` the instance served for its verhash, replacing an
    /// older instance with the same content.
    pub fn promote(&self, version: &Arc<ServerVersion>) {
        let mut versions = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        versions.insert(version.verhash().clone(), version.clone());
    }

    pub fn len(&self) -> usize {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An immutable server-held snapshot.
#[derive(Debug)]
pub struct ServerVersion {
    store: Weak<Registry>,
    seqnum: u64,
    verhash: Verhash,
    signed: SignedVerhash,
    kevs: KevMap,
}

impl ServerVersion {
    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn verhash(&self) -> &Verhash {
        &self.verhash
    }

    /// The pointer exactly as the client sent it.
    pub fn signed_verhash(&self) -> &SignedVerhash {
        &self.signed
    }

    pub fn kevs(&self) -> &KevMap {
        &self.kevs
    }

    pub fn len(&self) -> usize {
        self.kevs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kevs.is_empty()
    }

    /// Start an inbound build for `signed`, seeded from this version.
    pub fn next_version(&self, signed: &SignedVerhash) -> Result<ServerNewVersion> {
        ServerNewVersion::new(self.store.clone(), signed, self.kevs.clone())
    }

    pub fn create_delta_from(&self, old: Option<&ServerVersion>) -> Vec<DeltaEntry> {
        match old {
            Some(old) => compute_delta(&old.kevs, &self.kevs),
            None => compute_delta(&KevMap::new(), &self.kevs),
        }
    }
}

/// A server version under construction.
#[derive(Debug)]
pub struct ServerNewVersion {
    store: Weak<Registry>,
    seqnum: u64,
    expected: Verhash,
    signed: SignedVerhash,
    kevs: KevMap,
}

impl ServerNewVersion {
    fn new(store: Weak<Registry>, signed: &SignedVerhash, kevs: KevMap) -> Result<Self> {
        let pointer = parse_version_pointer(signed)?;
        Ok(Self {
            store,
            seqnum: pointer.seqnum,
            expected: pointer.verhash,
            signed: signed.clone(),
            kevs,
        })
    }

    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn set_kev(&mut self, key: impl Into<String>, ciphertext: Ciphertext) {
        self.kevs.insert(key.into(), ciphertext);
    }

    pub fn delete_key(&mut self, key: &str) {
        self.kevs.remove(key);
    }

    pub fn apply(&mut self, deltas: &[DeltaEntry]) {
        for delta in deltas {
            match &delta.op {
                DeltaOp::Set(ct) => self.set_kev(delta.key.clone(), ct.clone()),
                DeltaOp::Delete => self.delete_key(&delta.key),
            }
        }
    }

    /// Check the hash against the pointer and register the version.
    pub fn close(self) -> Result<Arc<ServerVersion>> {
        let verhash = compute_version_hash(&self.kevs);
        if verhash != self.expected {
            return Err(SyncError::Integrity(format!(
                "Pushed version hash mismatch: expected {}, got {}",
                self.expected, verhash
            )));
        }

        let version = Arc::new(ServerVersion {
            store: self.store.clone(),
            seqnum: self.seqnum,
            verhash,
            signed: self.signed,
            kevs: self.kevs,
        });
        if let Some(registry) = self.store.upgrade() {
            let mut versions = registry.write().unwrap_or_else(PoisonError::into_inner);
            versions
                .entry(version.verhash.clone())
                .or_insert_with(|| version.clone());
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encrypt_record, sign_version_pointer, Keyring};

    fn signed_for(keyring: &Keyring, seqnum: u64, kevs: &KevMap) -> SignedVerhash {
        sign_version_pointer(keyring.sign_key(), seqnum, &compute_version_hash(kevs)).unwrap()
    }

    fn sample(keyring: &Keyring) -> KevMap {
        ["a", "b", "c"]
            .iter()
            .map(|k| (k.to_string(), encrypt_record(keyring.enc_key(), k.as_bytes())))
            .collect()
    }

    #[test]
    fn full_snapshot_build_and_delta() {
        let keyring = Keyring::from_secret(b"s").unwrap();
        let kevs = sample(&keyring);
        let signed = signed_for(&keyring, 1, &kevs);

        let store = ServerVersionStore::new();
        let mut nv = store.create_new_version(&signed).unwrap();
        nv.apply(&compute_delta(&KevMap::new(), &kevs));
        let v1 = nv.close().unwrap();

        assert_eq!(v1.seqnum(), 1);
        assert_eq!(v1.signed_verhash(), &signed);
        assert_eq!(v1.kevs(), &kevs);
        assert!(store.get_version(v1.verhash()).is_some());

        let mut next_kevs = kevs.clone();
        next_kevs.remove("a");
        let signed2 = signed_for(&keyring, 2, &next_kevs);
        let mut nv = v1.next_version(&signed2).unwrap();
        nv.delete_key("a");
        let v2 = nv.close().unwrap();
        assert_eq!(v2.create_delta_from(Some(&*v1)), vec![DeltaEntry::delete("a")]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn mismatched_content_is_rejected() {
        let keyring = Keyring::from_secret(b"s").unwrap();
        let kevs = sample(&keyring);
        let signed = signed_for(&keyring, 1, &kevs);

        let store = ServerVersionStore::new();
        let mut nv = store.create_new_version(&signed).unwrap();
        nv.apply(&compute_delta(&KevMap::new(), &kevs));
        nv.delete_key("b");
        assert!(matches!(nv.close(), Err(SyncError::Integrity(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn malformed_pointer_is_rejected() {
        let store = ServerVersionStore::new();
        let bad = SignedVerhash::from("not-a-pointer");
        assert!(matches!(
            store.create_new_version(&bad),
            Err(SyncError::Integrity(_))
        ));
    }
}
