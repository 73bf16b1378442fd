//! Client-side versions.
//!
//! There are four ways to obtain a [`NewVersion`]:
//!
//! 1. [`VersionStore::create_first_version`]: empty maps, seqnum 1.
//! 2. [`Version::next_version`]: a local edit on top of an existing version.
//! 3. [`Version::create_new_version`]: inbound deltas from the server on top
//!    of a version this device already holds.
//! 4. [`VersionStore::create_new_version`]: an inbound full snapshot.
//!
//! Inbound builders carry the verhash bound from a verified signed pointer.
//! Ciphertext received through [`NewVersion::set_kev`] is only decrypted
//! by [`NewVersion::close`], after the aggregate hash has been checked.

use crate::crypto::{
    compute_version_hash, decrypt_record, encrypt_record, sign_version_pointer,
    verify_version_pointer, Ciphertext, Keyring, SignedVerhash, Verhash,
};
use crate::versions::delta::{compute_delta, DeltaEntry};
use crate::versions::{KevMap, KvMap};
use crate::{Result, SyncError};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use tracing::debug;

struct StoreInner {
    keyring: Arc<Keyring>,
    versions: RwLock<HashMap<Verhash, Arc<Version>>>,
}

impl StoreInner {
    fn add_version(&self, version: Arc<Version>) {
        let mut versions = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        // newest instance wins; freeing an older one is then a no-op
        versions.insert(version.verhash().clone(), version);
    }
}

/// Registry of closed versions for one device, indexed by verhash.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct VersionStore {
    inner: Arc<StoreInner>,
}

impl VersionStore {
    pub fn new(keyring: Keyring) -> Self {
        Self::with_keyring(Arc::new(keyring))
    }

    pub fn with_keyring(keyring: Arc<Keyring>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                keyring,
                versions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn keyring(&self) -> &Keyring {
        &self.inner.keyring
    }

    /// Start the very first version of a dataset.
    pub fn create_first_version(&self) -> NewVersion {
        NewVersion::new(self, 1, None, KvMap::new(), KevMap::new())
    }

    /// Start an inbound full-snapshot build for `signed`.
    ///
    /// Fails with [`SyncError::Integrity`] if the pointer does not verify.
    pub fn create_new_version(&self, signed: &SignedVerhash) -> Result<NewVersion> {
        let pointer = verify_version_pointer(self.inner.keyring.sign_key(), signed)?;
        Ok(NewVersion::new(
            self,
            pointer.seqnum,
            Some(pointer.verhash),
            KvMap::new(),
            KevMap::new(),
        ))
    }

    pub fn get_version(&self, verhash: &Verhash) -> Option<Arc<Version>> {
        let versions = self.inner.versions.read().unwrap_or_else(PoisonError::into_inner);
        versions.get(verhash).cloned()
    }

    /// Evict a superseded version. Holders of the `Arc` keep it alive.
    pub fn free(&self, version: &Version) {
        let mut versions = self.inner.versions.write().unwrap_or_else(PoisonError::into_inner);
        let registered = versions
            .get(version.verhash())
            .is_some_and(|v| std::ptr::eq(v.as_ref(), version));
        if registered {
            versions.remove(version.verhash());
            debug!("Freed version {}", version.verhash());
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStore")
            .field("versions", &self.len())
            .finish()
    }
}

/// An immutable snapshot with both plaintext and ciphertext maps.
pub struct Version {
    store: Weak<StoreInner>,
    keyring: Arc<Keyring>,
    seqnum: u64,
    verhash: Verhash,
    signed: OnceLock<SignedVerhash>,
    kvs: KvMap,
    kevs: KevMap,
}

impl Version {
    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn verhash(&self) -> &Verhash {
        &self.verhash
    }

    /// The signed `{seqnum, verhash}` pointer, computed on first use.
    pub fn signed_verhash(&self) -> Result<SignedVerhash> {
        if let Some(signed) = self.signed.get() {
            return Ok(signed.clone());
        }
        let signed = sign_version_pointer(self.keyring.sign_key(), self.seqnum, &self.verhash)?;
        Ok(self.signed.get_or_init(|| signed).clone())
    }

    pub fn kvs(&self) -> &KvMap {
        &self.kvs
    }

    pub fn kevs(&self) -> &KevMap {
        &self.kevs
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.kvs.get(key)
    }

    pub fn len(&self) -> usize {
        self.kevs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kevs.is_empty()
    }

    /// Start a local edit on top of this version, at `seqnum + 1`.
    pub fn next_version(&self) -> Result<NewVersion> {
        let seqnum = self.seqnum.checked_add(1).ok_or_else(|| {
            SyncError::Protocol(format!("Seqnum {} cannot be incremented", self.seqnum))
        })?;
        Ok(NewVersion {
            store: self.store.clone(),
            keyring: self.keyring.clone(),
            seqnum,
            expected: None,
            kvs: self.kvs.clone(),
            kevs: self.kevs.clone(),
            pending: BTreeSet::new(),
        })
    }

    /// Start an inbound delta build for `signed`, seeded from this version.
    pub fn create_new_version(&self, signed: &SignedVerhash) -> Result<NewVersion> {
        let pointer = verify_version_pointer(self.keyring.sign_key(), signed)?;
        Ok(NewVersion {
            store: self.store.clone(),
            keyring: self.keyring.clone(),
            seqnum: pointer.seqnum,
            expected: Some(pointer.verhash),
            kvs: self.kvs.clone(),
            kevs: self.kevs.clone(),
            pending: BTreeSet::new(),
        })
    }

    /// The edit script from `old` (or from nothing) to this version.
    pub fn create_delta_from(&self, old: Option<&Version>) -> Vec<DeltaEntry> {
        match old {
            Some(old) => compute_delta(&old.kevs, &self.kevs),
            None => compute_delta(&KevMap::new(), &self.kevs),
        }
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("seqnum", &self.seqnum)
            .field("verhash", &self.verhash)
            .field("keys", &self.kevs.len())
            .finish()
    }
}

/// A version under construction. Consumed by [`NewVersion::close`].
pub struct NewVersion {
    store: Weak<StoreInner>,
    keyring: Arc<Keyring>,
    seqnum: u64,
    expected: Option<Verhash>,
    kvs: KvMap,
    kevs: KevMap,
    /// Keys whose ciphertext arrived via `set_kev` and has not been decrypted.
    pending: BTreeSet<String>,
}

impl NewVersion {
    fn new(
        store: &VersionStore,
        seqnum: u64,
        expected: Option<Verhash>,
        kvs: KvMap,
        kevs: KevMap,
    ) -> Self {
        Self {
            store: Arc::downgrade(&store.inner),
            keyring: store.inner.keyring.clone(),
            seqnum,
            expected,
            kvs,
            kevs,
            pending: BTreeSet::new(),
        }
    }

    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn expected_verhash(&self) -> Option<&Verhash> {
        self.expected.as_ref()
    }

    /// Encrypt and store one plaintext value.
    pub fn set_kv(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        let key = key.into();
        let plaintext = serde_json::to_vec(&value)?;
        let ciphertext = encrypt_record(self.keyring.enc_key(), &plaintext);
        self.pending.remove(&key);
        self.kevs.insert(key.clone(), ciphertext);
        self.kvs.insert(key, value);
        Ok(())
    }

    pub fn delete_key(&mut self, key: &str) {
        self.pending.remove(key);
        self.kvs.remove(key);
        self.kevs.remove(key);
    }

    /// Record inbound ciphertext. Decryption is deferred to `close`.
    pub fn set_kev(&mut self, key: impl Into<String>, ciphertext: Ciphertext) {
        let key = key.into();
        self.kvs.remove(&key);
        self.kevs.insert(key.clone(), ciphertext);
        self.pending.insert(key);
    }

    /// Replace the working KV map with `new_kvs`.
    ///
    /// Values equal to the working copy keep their ciphertext, so an
    /// unchanged dataset closes to the same verhash.
    pub fn set_all_kvs(&mut self, new_kvs: &KvMap) -> Result<()> {
        let removed: Vec<String> = self
            .kevs
            .keys()
            .filter(|key| !new_kvs.contains_key(*key))
            .cloned()
            .collect();
        for key in removed {
            self.delete_key(&key);
        }

        for (key, value) in new_kvs {
            if self.kvs.get(key) != Some(value) {
                self.set_kv(key.clone(), value.clone())?;
            }
        }
        Ok(())
    }

    /// Finish the build.
    ///
    /// Computes the verhash, checks it against the expected one if any, then
    /// decrypts the ciphertext received by this build and registers the
    /// result in the store. On failure nothing is registered and the source
    /// versions are untouched.
    pub fn close(self) -> Result<Arc<Version>> {
        let verhash = compute_version_hash(&self.kevs);
        if let Some(expected) = &self.expected {
            if *expected != verhash {
                return Err(SyncError::Integrity(format!(
                    "Version hash mismatch: expected {}, got {}",
                    expected, verhash
                )));
            }
        }

        let mut kvs = self.kvs;
        for key in &self.pending {
            if let Some(ciphertext) = self.kevs.get(key) {
                let plaintext = decrypt_record(self.keyring.enc_key(), ciphertext)?;
                let value = serde_json::from_slice(&plaintext).map_err(|e| {
                    SyncError::CorruptRecord(format!("Record {} is not JSON: {}", key, e))
                })?;
                kvs.insert(key.clone(), value);
            }
        }

        let version = Arc::new(Version {
            store: self.store.clone(),
            keyring: self.keyring,
            seqnum: self.seqnum,
            verhash,
            signed: OnceLock::new(),
            kvs,
            kevs: self.kevs,
        });

        if let Some(store) = self.store.upgrade() {
            store.add_version(version.clone());
        }
        debug!(
            "Closed version seqnum={} verhash={}",
            version.seqnum, version.verhash
        );
        Ok(version)
    }
}

impl std::fmt::Debug for NewVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewVersion")
            .field("seqnum", &self.seqnum)
            .field("expected", &self.expected)
            .field("keys", &self.kevs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versions::delta::DeltaOp;
    use serde_json::json;

    fn store() -> VersionStore {
        VersionStore::new(Keyring::from_secret(b"test secret").unwrap())
    }

    fn v1(store: &VersionStore) -> Arc<Version> {
        let mut nv = store.create_first_version();
        nv.set_kv("key1", json!("a")).unwrap();
        nv.set_kv("key2", json!("b")).unwrap();
        nv.close().unwrap()
    }

    fn apply(nv: &mut NewVersion, deltas: &[DeltaEntry]) {
        for delta in deltas {
            match &delta.op {
                DeltaOp::Set(ct) => nv.set_kev(delta.key.clone(), ct.clone()),
                DeltaOp::Delete => nv.delete_key(&delta.key),
            }
        }
    }

    #[test]
    fn test_first_version() {
        let store = store();
        let v = v1(&store);
        assert_eq!(v.seqnum(), 1);
        assert_eq!(v.get("key1"), Some(&json!("a")));
        assert_eq!(v.kvs().len(), v.kevs().len());
        assert!(store.get_version(v.verhash()).is_some());
    }

    #[test]
    fn test_next_version_increments_seqnum() {
        let store = store();
        let v1 = v1(&store);
        let mut nv = v1.next_version().unwrap();
        nv.delete_key("key1");
        nv.set_kv("key3", json!({"nested": [1, 2]})).unwrap();
        let v2 = nv.close().unwrap();

        assert_eq!(v2.seqnum(), 2);
        assert_eq!(v2.get("key1"), None);
        assert_eq!(v2.get("key2"), Some(&json!("b")));
        // the source version is untouched
        assert_eq!(v1.get("key1"), Some(&json!("a")));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_signed_verhash_is_cached_and_verifies() {
        let store = store();
        let v = v1(&store);
        let signed = v.signed_verhash().unwrap();
        assert_eq!(v.signed_verhash().unwrap(), signed);

        let pointer = verify_version_pointer(store.keyring().sign_key(), &signed).unwrap();
        assert_eq!(pointer.seqnum, 1);
        assert_eq!(&pointer.verhash, v.verhash());
    }

    #[test]
    fn test_inbound_full_snapshot() {
        let sender = store();
        let v = v1(&sender);

        let receiver = VersionStore::new(Keyring::from_secret(b"test secret").unwrap());
        let mut nv = receiver
            .create_new_version(&v.signed_verhash().unwrap())
            .unwrap();
        apply(&mut nv, &v.create_delta_from(None));
        let got = nv.close().unwrap();

        assert_eq!(got.verhash(), v.verhash());
        assert_eq!(got.kvs(), v.kvs());
        assert_eq!(got.seqnum(), 1);
    }

    #[test]
    fn test_inbound_delta() {
        let store = store();
        let v1 = v1(&store);
        let mut nv = v1.next_version().unwrap();
        nv.set_all_kvs(
            &[("key2", json!("c")), ("key3", json!("d"))]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
        .unwrap();
        let v2 = nv.close().unwrap();

        let mut inbound = v1.create_new_version(&v2.signed_verhash().unwrap()).unwrap();
        apply(&mut inbound, &v2.create_delta_from(Some(&*v1)));
        let got = inbound.close().unwrap();
        assert_eq!(got.kvs(), v2.kvs());
    }

    #[test]
    fn test_tampered_delta_fails_close() {
        let store = store();
        let v = v1(&store);
        let mut deltas = v.create_delta_from(None);
        if let DeltaOp::Set(ct) = &deltas[0].op {
            let mut bytes = ct.as_bytes().to_vec();
            let last = bytes.len() - 1;
            bytes[last] ^= 0x01;
            deltas[0].op = DeltaOp::Set(Ciphertext::from_bytes(bytes));
        }

        let fresh = VersionStore::new(Keyring::from_secret(b"test secret").unwrap());
        let mut nv = fresh.create_new_version(&v.signed_verhash().unwrap()).unwrap();
        apply(&mut nv, &deltas);
        assert!(matches!(nv.close(), Err(SyncError::Integrity(_))));
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_wrong_key_pointer_rejected() {
        let v = v1(&store());
        let other = VersionStore::new(Keyring::from_secret(b"another secret").unwrap());
        assert!(matches!(
            other.create_new_version(&v.signed_verhash().unwrap()),
            Err(SyncError::Integrity(_))
        ));
    }

    #[test]
    fn test_set_all_kvs_keeps_unchanged_ciphertext() {
        let store = store();
        let v1 = v1(&store);
        let mut nv = v1.next_version().unwrap();
        nv.set_all_kvs(&v1.kvs().clone()).unwrap();
        let same = nv.close().unwrap();
        assert_eq!(same.verhash(), v1.verhash());
        assert_eq!(same.kevs(), v1.kevs());
    }

    #[test]
    fn test_next_version_rejects_seqnum_overflow() {
        let store = store();
        let signed = sign_version_pointer(
            store.keyring().sign_key(),
            u64::MAX,
            &compute_version_hash(&KevMap::new()),
        )
        .unwrap();
        let last = store.create_new_version(&signed).unwrap().close().unwrap();
        assert_eq!(last.seqnum(), u64::MAX);
        assert!(matches!(last.next_version(), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_repeated_content_registers_newest() {
        let store = store();
        let v1 = v1(&store);
        let mut nv = v1.next_version().unwrap();
        nv.set_kv("tmp", json!(1)).unwrap();
        let v2 = nv.close().unwrap();
        let mut nv = v2.next_version().unwrap();
        nv.delete_key("tmp");
        let v3 = nv.close().unwrap();
        assert_eq!(v3.verhash(), v1.verhash());

        // freeing the superseded instance keeps the newer one reachable
        store.free(&v1);
        let registered = store.get_version(v1.verhash()).unwrap();
        assert!(Arc::ptr_eq(&registered, &v3));
    }

    #[test]
    fn test_free_evicts() {
        let store = store();
        let v = v1(&store);
        store.free(&v);
        assert!(store.get_version(v.verhash()).is_none());
        // the handle itself is still usable
        assert_eq!(v.get("key2"), Some(&json!("b")));
    }
}
