//! In-process datastore and broadcast channel.

use crate::client::{Broadcast, DeviceEvent, LocalDatastore};
use crate::crypto::SignedVerhash;
use crate::versions::KvMap;
use crate::{Result, SyncError};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedSender;

fn channel_closed() -> SyncError {
    SyncError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "device event channel closed",
    ))
}

/// A key-value map that reports every write to its device.
pub struct MemoryDatastore {
    data: Mutex<KvMap>,
    /// Maps written by the device through `set_anyways`
    writes: Mutex<Vec<KvMap>>,
    events: UnboundedSender<DeviceEvent>,
}

impl MemoryDatastore {
    pub fn new(events: UnboundedSender<DeviceEvent>) -> Self {
        Self {
            data: Mutex::new(KvMap::new()),
            writes: Mutex::new(Vec::new()),
            events,
        }
    }

    /// A user edit: replace the contents and notify the device.
    pub fn write(&self, kvs: KvMap) -> Result<()> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = kvs.clone();
        self.events
            .send(DeviceEvent::LocalChanged(kvs))
            .map_err(|_| channel_closed())
    }

    pub fn snapshot(&self) -> KvMap {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drain the record of device-initiated writes.
    pub fn take_writes(&self) -> Vec<KvMap> {
        std::mem::take(&mut *self.writes.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl LocalDatastore for MemoryDatastore {
    fn set_anyways(&self, kvs: &KvMap) -> Result<()> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(kvs.clone());
        self.write(kvs.clone())
    }
}

/// Fans announced pointers out to every subscribed device.
#[derive(Default)]
pub struct MemoryBroadcast {
    subscribers: Mutex<Vec<UnboundedSender<DeviceEvent>>>,
    sent: Mutex<Vec<SignedVerhash>>,
}

impl MemoryBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, events: UnboundedSender<DeviceEvent>) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(events);
    }

    /// Drain the record of announced pointers.
    pub fn take_sent(&self) -> Vec<SignedVerhash> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Broadcast for MemoryBroadcast {
    fn set(&self, signed: &SignedVerhash) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signed.clone());
        // closed subscribers are dropped
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(DeviceEvent::PeerPointer(Some(signed.clone()))).is_ok());
        Ok(())
    }
}
