//! Conflict merge policies.

use crate::versions::{KvMap, Version};
use crate::Result;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Combines a common base, the local version and the server's version.
///
/// Must return a closed version derived from `theirs` (either `theirs`
/// itself or one built with `theirs.next_version()`), so that its seqnum
/// exceeds the server's.
pub trait Merge: Send + Sync {
    fn merge(
        &self,
        base: Option<&Arc<Version>>,
        mine: Option<&Arc<Version>>,
        theirs: &Arc<Version>,
    ) -> Result<Arc<Version>>;
}

/// Discard local changes and take the server's version.
#[derive(Debug, Clone, Copy, Default)]
pub struct TheirsWins;

impl Merge for TheirsWins {
    fn merge(
        &self,
        _base: Option<&Arc<Version>>,
        _mine: Option<&Arc<Version>>,
        theirs: &Arc<Version>,
    ) -> Result<Arc<Version>> {
        Ok(theirs.clone())
    }
}

/// Replay every key changed locally since `base` on top of `theirs`.
///
/// Keys changed on both sides take the local value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreeWayMerge;

impl Merge for ThreeWayMerge {
    fn merge(
        &self,
        base: Option<&Arc<Version>>,
        mine: Option<&Arc<Version>>,
        theirs: &Arc<Version>,
    ) -> Result<Arc<Version>> {
        let Some(mine) = mine else {
            return Ok(theirs.clone());
        };
        let empty = KvMap::new();
        let base_kvs = base.map(|b| b.kvs()).unwrap_or(&empty);

        let keys: BTreeSet<&String> = base_kvs.keys().chain(mine.kvs().keys()).collect();
        let mut merged = theirs.next_version()?;
        let mut changed = false;
        for key in keys {
            let local = mine.get(key);
            if base_kvs.get(key.as_str()) == local {
                continue;
            }
            match local {
                Some(value) if theirs.get(key) != Some(value) => {
                    merged.set_kv(key.clone(), value.clone())?;
                    changed = true;
                }
                None if theirs.get(key).is_some() => {
                    merged.delete_key(key);
                    changed = true;
                }
                _ => {}
            }
        }

        if changed {
            merged.close()
        } else {
            Ok(theirs.clone())
        }
    }
}
