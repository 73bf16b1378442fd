//! Wire format for the push/pull protocol.
//!
//! Requests and responses are JSON objects tagged by `type`:
//!
//! ```text
//! push  {type:"push", from, to, first, upto, batch}
//!   -> {type:"ok"} | {type:"out-of-date", serverVersion}
//!    | {type:"bad-seqnum", serverVersion} | {type:"missing-keys"}
//! pull  {type:"pull", from, to, first}
//!   -> {type:"ok", deltas, next} | {type:"unknown-delta", serverVersion}
//!    | {type:"missing-keys"}
//! ```

use crate::crypto::{SignedVerhash, Verhash};
use crate::versions::DeltaEntry;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in a delta stream.
///
/// Markers serialize as bare strings; a key position serializes as
/// `{"key": "..."}`, so data keys never collide with markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    #[serde(rename = "START")]
    Start,
    #[serde(rename = "END")]
    End,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "key")]
    Key(String),
}

impl Cursor {
    /// The cursor naming `deltas[index]`, or `end` past the last entry.
    pub(crate) fn at(deltas: &[DeltaEntry], index: usize, end: Cursor) -> Cursor {
        match deltas.get(index) {
            Some(entry) => Cursor::Key(entry.key.clone()),
            None => end,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Start => f.write_str("START"),
            Cursor::End => f.write_str("END"),
            Cursor::Done => f.write_str("DONE"),
            Cursor::Key(key) => write!(f, "key:{}", key),
        }
    }
}

/// One batch of an outbound version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Verhash the client believes is current on the server
    pub from: Option<Verhash>,
    /// Signed pointer of the version being pushed
    pub to: SignedVerhash,
    pub first: Cursor,
    pub upto: Cursor,
    pub batch: Vec<DeltaEntry>,
}

/// A request for one page of the delta `from -> to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Base verhash the client holds; `None` asks for a full snapshot
    pub from: Option<Verhash>,
    pub to: SignedVerhash,
    pub first: Cursor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    Push(PushRequest),
    Pull(PullRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    /// Push accepted, or one page of a pull.
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deltas: Option<Vec<DeltaEntry>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<Cursor>,
    },
    OutOfDate {
        #[serde(rename = "serverVersion")]
        server_version: Option<SignedVerhash>,
    },
    BadSeqnum {
        #[serde(rename = "serverVersion")]
        server_version: Option<SignedVerhash>,
    },
    MissingKeys,
    UnknownDelta {
        #[serde(rename = "serverVersion")]
        server_version: Option<SignedVerhash>,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok {
            deltas: None,
            next: None,
        }
    }

    pub fn page(deltas: Vec<DeltaEntry>, next: Cursor) -> Self {
        Response::Ok {
            deltas: Some(deltas),
            next: Some(next),
        }
    }

    /// Short name used in logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ok { .. } => "ok",
            Response::OutOfDate { .. } => "out-of-date",
            Response::BadSeqnum { .. } => "bad-seqnum",
            Response::MissingKeys => "missing-keys",
            Response::UnknownDelta { .. } => "unknown-delta",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ciphertext;
    use serde_json::json;

    #[test]
    fn cursor_encoding() {
        assert_eq!(serde_json::to_value(Cursor::Start).unwrap(), json!("START"));
        assert_eq!(serde_json::to_value(Cursor::Done).unwrap(), json!("DONE"));
        assert_eq!(
            serde_json::to_value(Cursor::Key("START".into())).unwrap(),
            json!({"key": "START"})
        );
        let back: Cursor = serde_json::from_value(json!({"key": "START"})).unwrap();
        assert_eq!(back, Cursor::Key("START".into()));
        let back: Cursor = serde_json::from_value(json!("END")).unwrap();
        assert_eq!(back, Cursor::End);
    }

    #[test]
    fn push_request_shape() {
        let req = Request::Push(PushRequest {
            from: None,
            to: SignedVerhash::from("1:abcd:mac"),
            first: Cursor::Start,
            upto: Cursor::End,
            batch: vec![
                DeltaEntry::set("k", Ciphertext::from_bytes(vec![1, 2, 3])),
                DeltaEntry::delete("gone"),
            ],
        });
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "push",
                "from": null,
                "to": "1:abcd:mac",
                "first": "START",
                "upto": "END",
                "batch": [["k", "set", "AQID"], ["gone", "del"]],
            })
        );
        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn response_shapes() {
        assert_eq!(serde_json::to_value(Response::ok()).unwrap(), json!({"type": "ok"}));
        assert_eq!(
            serde_json::to_value(Response::MissingKeys).unwrap(),
            json!({"type": "missing-keys"})
        );
        assert_eq!(
            serde_json::to_value(Response::OutOfDate {
                server_version: Some(SignedVerhash::from("2:ef:mac"))
            })
            .unwrap(),
            json!({"type": "out-of-date", "serverVersion": "2:ef:mac"})
        );

        let page: Response = serde_json::from_value(json!({
            "type": "ok",
            "deltas": [["a", "del"]],
            "next": "DONE",
        }))
        .unwrap();
        assert_eq!(page, Response::page(vec![DeltaEntry::delete("a")], Cursor::Done));
    }
}
