//! Delta algebra over KEV maps.
//!
//! A delta is an ordered edit script turning one KEV map into another. Keys
//! are visited in ascending order so that two implementations produce
//! byte-identical deltas for the same pair of maps.
//!
//! On the wire an entry is a JSON array: `[key, "set", base64(ct)]` or
//! `[key, "del"]`.

use crate::crypto::Ciphertext;
use crate::versions::KevMap;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// One edit operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    Set(Ciphertext),
    Delete,
}

/// An edit applied to a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaEntry {
    pub key: String,
    pub op: DeltaOp,
}

impl DeltaEntry {
    pub fn set(key: impl Into<String>, ciphertext: Ciphertext) -> Self {
        Self {
            key: key.into(),
            op: DeltaOp::Set(ciphertext),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: DeltaOp::Delete,
        }
    }
}

/// Compute the edit script that turns `old` into `new`.
///
/// `old` may be empty, which yields a full-snapshot delta.
pub fn compute_delta(old: &KevMap, new: &KevMap) -> Vec<DeltaEntry> {
    let all_keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    let mut deltas = Vec::new();
    for key in all_keys {
        match (old.get(key), new.get(key)) {
            (_, None) => deltas.push(DeltaEntry::delete(key.clone())),
            (None, Some(ct)) => deltas.push(DeltaEntry::set(key.clone(), ct.clone())),
            (Some(old_ct), Some(new_ct)) if old_ct != new_ct => {
                deltas.push(DeltaEntry::set(key.clone(), new_ct.clone()))
            }
            _ => {}
        }
    }
    deltas
}

/// Apply an edit script to a KEV map in place.
pub fn apply_delta(map: &mut KevMap, deltas: &[DeltaEntry]) {
    for delta in deltas {
        match &delta.op {
            DeltaOp::Set(ct) => {
                map.insert(delta.key.clone(), ct.clone());
            }
            DeltaOp::Delete => {
                map.remove(&delta.key);
            }
        }
    }
}

impl Serialize for DeltaEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.op {
            DeltaOp::Set(ct) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&self.key)?;
                seq.serialize_element("set")?;
                seq.serialize_element(ct)?;
                seq.end()
            }
            DeltaOp::Delete => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(&self.key)?;
                seq.serialize_element("del")?;
                seq.end()
            }
        }
    }
}

struct DeltaEntryVisitor;

impl<'de> Visitor<'de> for DeltaEntryVisitor {
    type Value = DeltaEntry;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("[key, \"set\", ciphertext] or [key, \"del\"]")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<DeltaEntry, A::Error> {
        let key: String = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let command: String = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;

        let op = match command.as_str() {
            "set" => {
                let ct: Ciphertext = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                DeltaOp::Set(ct)
            }
            "del" => DeltaOp::Delete,
            other => {
                return Err(de::Error::custom(format!("unknown delta command: {}", other)));
            }
        };

        if seq.next_element::<de::IgnoredAny>()?.is_some() {
            return Err(de::Error::custom("trailing elements in delta entry"));
        }

        Ok(DeltaEntry { key, op })
    }
}

impl<'de> Deserialize<'de> for DeltaEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(DeltaEntryVisitor)
    }
}
