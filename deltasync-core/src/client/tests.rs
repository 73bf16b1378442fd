use super::*;
use crate::crypto::{parse_version_pointer, Keyring};
use crate::server::Server;
use crate::transfer::LoopbackTransport;
use serde_json::json;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

fn kv(entries: &[(&str, &str)]) -> KvMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

/// Records what each merge was handed, then lets theirs win.
#[derive(Default)]
struct RecordingMerge {
    theirs: Mutex<Vec<SignedVerhash>>,
}

impl Merge for RecordingMerge {
    fn merge(
        &self,
        base: Option<&Arc<Version>>,
        mine: Option<&Arc<Version>>,
        theirs: &Arc<Version>,
    ) -> Result<Arc<Version>> {
        self.theirs.lock().unwrap().push(theirs.signed_verhash()?);
        TheirsWins.merge(base, mine, theirs)
    }
}

struct Harness {
    device: Device,
    local: Arc<MemoryDatastore>,
    broadcast: Arc<MemoryBroadcast>,
    events: UnboundedReceiver<DeviceEvent>,
}

impl Harness {
    fn new(name: &str, server: &Server, merge: Arc<dyn Merge>) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let local = Arc::new(MemoryDatastore::new(tx));
        let broadcast = Arc::new(MemoryBroadcast::new());
        let store = VersionStore::new(Keyring::from_secret(b"device test secret").unwrap());
        let device = Device::new(
            name,
            store,
            Collaborators {
                transport: Arc::new(LoopbackTransport::new(server.clone())),
                local: local.clone(),
                broadcast: broadcast.clone(),
                merge,
            },
            SyncConfig::default(),
        );
        Self {
            device,
            local,
            broadcast,
            events,
        }
    }

    /// Handle every queued datastore notification.
    async fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.device.handle_event(event).await.unwrap();
        }
    }

    async fn edit(&mut self, kvs: KvMap) {
        self.local.write(kvs).unwrap();
        self.pump().await;
    }

    async fn hear(&mut self, signed: &SignedVerhash) {
        self.device
            .handle_event(DeviceEvent::PeerPointer(Some(signed.clone())))
            .await
            .unwrap();
        self.pump().await;
    }
}

#[tokio::test]
async fn test_two_devices_converge() {
    let server = Server::default();
    let merges = Arc::new(RecordingMerge::default());
    let mut a = Harness::new("A", &server, merges.clone());

    // initial data
    let kv1 = kv(&[("key", "value")]);
    a.edit(kv1.clone()).await;
    assert!(a.local.take_writes().is_empty());
    let sent = a.broadcast.take_sent();
    assert_eq!(sent.len(), 1);
    let v1 = sent[0].clone();
    assert_eq!(v1, a.device.mine().unwrap().signed_verhash().unwrap());
    assert_eq!(parse_version_pointer(&v1).unwrap().seqnum, 1);

    // hearing its own broadcast changes nothing
    a.hear(&v1).await;
    assert!(a.local.take_writes().is_empty());
    assert!(a.broadcast.take_sent().is_empty());

    let kv2 = kv(&[("key", "value2")]);
    a.edit(kv2.clone()).await;
    let sent = a.broadcast.take_sent();
    assert_eq!(sent.len(), 1);
    let v2 = sent[0].clone();
    assert_eq!(parse_version_pointer(&v2).unwrap().seqnum, 2);
    a.hear(&v2).await;
    assert!(a.broadcast.take_sent().is_empty());

    // B starts with its own data, finds the server ahead, and gets clobbered
    let mut b = Harness::new("B", &server, merges.clone());
    b.edit(kv(&[("key", "valueB")])).await;
    assert!(b.broadcast.take_sent().is_empty());
    assert_eq!(b.local.take_writes(), vec![kv2.clone()]);
    assert_eq!(
        std::mem::take(&mut *merges.theirs.lock().unwrap()),
        vec![v2.clone()]
    );
    assert_eq!(b.local.snapshot(), kv2);

    // B hears A's v2: already there
    b.hear(&v2).await;
    assert!(b.local.take_writes().is_empty());
    assert!(b.broadcast.take_sent().is_empty());

    // A moves on and B catches up through a delta pull
    let kv3 = kv(&[("key", "value3"), ("key2", "value4")]);
    a.edit(kv3.clone()).await;
    let sent = a.broadcast.take_sent();
    assert_eq!(sent.len(), 1);
    let v3 = sent[0].clone();
    assert_eq!(parse_version_pointer(&v3).unwrap().seqnum, 3);
    a.hear(&v3).await;
    assert!(a.local.take_writes().is_empty());

    b.hear(&v3).await;
    assert_eq!(b.local.take_writes(), vec![kv3.clone()]);
    assert!(b.broadcast.take_sent().is_empty());
    assert_eq!(b.local.snapshot(), kv3);
    assert_eq!(
        b.device.server().unwrap().verhash(),
        a.device.mine().unwrap().verhash()
    );
    assert!(merges.theirs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_edits_merge_three_way() {
    let server = Server::default();
    let mut a = Harness::new("A", &server, Arc::new(ThreeWayMerge));
    let mut b = Harness::new("B", &server, Arc::new(ThreeWayMerge));

    a.edit(kv(&[("a", "1"), ("b", "1")])).await;
    let v1 = a.broadcast.take_sent().remove(0);
    b.hear(&v1).await;
    assert_eq!(b.local.snapshot(), kv(&[("a", "1"), ("b", "1")]));
    b.local.take_writes();

    // B wins the race
    b.edit(kv(&[("a", "2"), ("b", "1")])).await;
    let v2 = b.broadcast.take_sent().remove(0);

    // A edited from v1; its push is out of date, so it merges and re-pushes
    a.edit(kv(&[("a", "1"), ("b", "2")])).await;
    let merged = kv(&[("a", "2"), ("b", "2")]);
    assert_eq!(a.local.take_writes(), vec![merged.clone()]);
    let sent = a.broadcast.take_sent();
    assert_eq!(sent.len(), 1);
    let v3 = sent[0].clone();
    assert_eq!(parse_version_pointer(&v3).unwrap().seqnum, 3);
    assert_ne!(v3, v2);

    b.hear(&v3).await;
    assert_eq!(b.local.snapshot(), merged);
    assert_eq!(a.local.snapshot(), merged);
    assert_eq!(server.current().await.unwrap().signed_verhash(), &v3);
}

#[tokio::test]
async fn test_device_recovers_after_server_reset() {
    let server = Server::default();
    let mut a = Harness::new("A", &server, Arc::new(TheirsWins));
    a.edit(kv(&[("k", "v")])).await;
    a.broadcast.take_sent();

    // same device, new empty server
    let fresh = Server::default();
    let mut a2 = Harness::new("A2", &fresh, Arc::new(TheirsWins));
    a2.device.mine = a.device.mine.clone();
    a2.device.server = a.device.server.clone();
    a2.device.base = a.device.base.clone();

    a2.edit(kv(&[("k", "v2")])).await;
    assert_eq!(a2.broadcast.take_sent().len(), 1);
    let current = fresh.current().await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current.seqnum(), 2);
}

#[tokio::test]
async fn test_superseded_versions_are_freed() {
    let server = Server::default();
    let mut a = Harness::new("A", &server, Arc::new(TheirsWins));
    let mut b = Harness::new("B", &server, Arc::new(TheirsWins));

    for i in 0..50 {
        let value = i.to_string();
        a.edit(kv(&[("counter", value.as_str())])).await;
        for signed in a.broadcast.take_sent() {
            b.hear(&signed).await;
        }
    }

    assert_eq!(a.device.mine().unwrap().seqnum(), 50);
    assert_eq!(a.device.store().len(), 1);
    assert_eq!(b.device.store().len(), 1);
    assert_eq!(b.local.snapshot(), kv(&[("counter", "49")]));

    // B misses A's next edit, so its own edit is merged away
    a.edit(kv(&[("counter", "50")])).await;
    b.edit(kv(&[("counter", "stale")])).await;
    assert_eq!(b.local.snapshot(), kv(&[("counter", "50")]));
    assert_eq!(b.device.store().len(), 1);
}
