//! Per-device sync orchestration.
//!
//! A device tracks three versions:
//!
//! - `mine`: the latest local version
//! - `base`: the last version known to be shared with the server
//! - `server`: the latest known server version
//!
//! Notifications from the local datastore and from the peer broadcast
//! channel arrive as [`DeviceEvent`]s and are handled one at a time.

mod memory;
mod merge;

pub use memory::{MemoryBroadcast, MemoryDatastore};
pub use merge::{Merge, TheirsWins, ThreeWayMerge};

use crate::config::SyncConfig;
use crate::crypto::SignedVerhash;
use crate::transfer::{pull, push, PullOutcome, PushOutcome, Transport};
use crate::versions::{KvMap, Version, VersionStore};
use crate::{Result, SyncError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The device's native key-value store.
///
/// After every `set_anyways` the store must deliver at least one
/// [`DeviceEvent::LocalChanged`], even if the value did not change.
pub trait LocalDatastore: Send + Sync {
    fn set_anyways(&self, kvs: &KvMap) -> Result<()>;
}

/// Channel announcing newly installed server versions to all devices.
pub trait Broadcast: Send + Sync {
    fn set(&self, signed: &SignedVerhash) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The local datastore now holds this map.
    LocalChanged(KvMap),
    /// A peer announced a server version.
    PeerPointer(Option<SignedVerhash>),
}

/// Everything a device talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub local: Arc<dyn LocalDatastore>,
    pub broadcast: Arc<dyn Broadcast>,
    pub merge: Arc<dyn Merge>,
}

pub struct Device {
    name: String,
    config: SyncConfig,
    store: VersionStore,
    peers: Collaborators,
    mine: Option<Arc<Version>>,
    base: Option<Arc<Version>>,
    server: Option<Arc<Version>>,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        store: VersionStore,
        peers: Collaborators,
        config: SyncConfig,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            peers,
            mine: None,
            base: None,
            server: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    pub fn mine(&self) -> Option<&Arc<Version>> {
        self.mine.as_ref()
    }

    pub fn base(&self) -> Option<&Arc<Version>> {
        self.base.as_ref()
    }

    pub fn server(&self) -> Option<&Arc<Version>> {
        self.server.as_ref()
    }

    /// Process events until every sender is dropped.
    ///
    /// A failed event is logged and does not stop the loop.
    pub async fn run(&mut self, mut events: mpsc::UnboundedReceiver<DeviceEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(event).await {
                warn!("[{}] sync attempt failed: {}", self.name, e);
            }
        }
        debug!("[{}] event channel closed", self.name);
    }

    pub async fn handle_event(&mut self, event: DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::LocalChanged(kvs) => self.local_changed(kvs).await,
            DeviceEvent::PeerPointer(Some(signed)) => self.peer_announced(signed).await,
            DeviceEvent::PeerPointer(None) => Ok(()),
        }
    }

    /// Move all three pointers, freeing versions none of them still names.
    fn set_pointers(
        &mut self,
        server: Option<Arc<Version>>,
        base: Option<Arc<Version>>,
        mine: Option<Arc<Version>>,
    ) {
        let old = [
            std::mem::replace(&mut self.server, server),
            std::mem::replace(&mut self.base, base),
            std::mem::replace(&mut self.mine, mine),
        ];
        for version in old.into_iter().flatten() {
            let held = [&self.server, &self.base, &self.mine]
                .into_iter()
                .flatten()
                .any(|v| v.verhash() == version.verhash());
            if !held {
                self.store.free(&version);
            }
        }
    }

    fn is_synced(&self) -> bool {
        match (&self.mine, &self.server) {
            (Some(mine), Some(server)) => {
                mine.verhash() == server.verhash() && mine.seqnum() == server.seqnum()
            }
            _ => false,
        }
    }

    async fn local_changed(&mut self, kvs: KvMap) -> Result<()> {
        if let Some(mine) = &self.mine {
            if mine.kvs() == &kvs {
                if self.is_synced() {
                    debug!("[{}] local change matches the server, nothing to do", self.name);
                    return Ok(());
                }
                // a merge result written back to the datastore
                return self.push_mine().await;
            }
        }

        let mut builder = match &self.mine {
            Some(mine) => mine.next_version()?,
            None => self.store.create_first_version(),
        };
        builder.set_all_kvs(&kvs)?;
        let version = builder.close()?;
        debug!("[{}] local change closed as seqnum {}", self.name, version.seqnum());
        self.set_pointers(self.server.clone(), self.base.clone(), Some(version));
        self.push_mine().await
    }

    async fn push_mine(&mut self) -> Result<()> {
        let Some(mine) = self.mine.clone() else {
            return Ok(());
        };

        let mut forgot_server = false;
        loop {
            let outcome = push(
                &mine,
                self.server.as_deref(),
                self.peers.transport.as_ref(),
                &self.config,
            )
            .await?;

            match outcome {
                PushOutcome::Success { server_version } => {
                    info!("[{}] pushed seqnum {}", self.name, mine.seqnum());
                    self.set_pointers(Some(mine.clone()), Some(mine.clone()), Some(mine));
                    return self.peers.broadcast.set(&server_version);
                }
                PushOutcome::OutOfDate {
                    server_version: Some(theirs),
                }
                | PushOutcome::BadSeqnum {
                    server_version: Some(theirs),
                } => return self.fetch_and_merge(theirs).await,
                PushOutcome::OutOfDate { server_version: None }
                | PushOutcome::BadSeqnum { server_version: None } => {
                    if forgot_server {
                        return Err(SyncError::Protocol(
                            "Server rejected a push onto an empty dataset".to_string(),
                        ));
                    }
                    warn!("[{}] server has no version, pushing a full snapshot", self.name);
                    forgot_server = true;
                    self.set_pointers(None, None, self.mine.clone());
                }
            }
        }
    }

    /// Pull the server's version, merge, and write the result locally.
    ///
    /// The datastore's change notification for that write pushes the merge
    /// result if it differs from the server's version.
    async fn fetch_and_merge(&mut self, mut target: SignedVerhash) -> Result<()> {
        let mut attempts = 0;
        let theirs = loop {
            let outcome = pull(
                &target,
                self.server.clone(),
                &self.store,
                self.peers.transport.as_ref(),
                &self.config,
            )
            .await?;
            match outcome {
                PullOutcome::Success { version } => break version,
                PullOutcome::OutOfDate {
                    server_version: Some(newer),
                } if attempts < self.config.max_restarts => {
                    attempts += 1;
                    target = newer;
                }
                PullOutcome::OutOfDate { .. } => {
                    return Err(SyncError::Protocol(
                        "Server version kept moving during merge".to_string(),
                    ));
                }
            }
        };

        let merged = self
            .peers
            .merge
            .merge(self.base.as_ref(), self.mine.as_ref(), &theirs)?;
        info!(
            "[{}] merged with server seqnum {} -> seqnum {}",
            self.name,
            theirs.seqnum(),
            merged.seqnum()
        );

        self.set_pointers(Some(theirs.clone()), Some(theirs), Some(merged.clone()));
        self.peers.local.set_anyways(merged.kvs())
    }

    /// Fast-forward to a version a peer already merged and installed.
    async fn peer_announced(&mut self, signed: SignedVerhash) -> Result<()> {
        if let Some(server) = &self.server {
            if server.signed_verhash()? == signed {
                debug!("[{}] already at announced version", self.name);
                return Ok(());
            }
        }

        let outcome = pull(
            &signed,
            self.server.clone(),
            &self.store,
            self.peers.transport.as_ref(),
            &self.config,
        )
        .await?;
        match outcome {
            PullOutcome::Success { version } => {
                info!("[{}] fast-forward to seqnum {}", self.name, version.seqnum());
                self.set_pointers(
                    Some(version.clone()),
                    Some(version.clone()),
                    Some(version.clone()),
                );
                self.peers.local.set_anyways(version.kvs())
            }
            PullOutcome::OutOfDate { .. } => {
                warn!("[{}] announced version is already gone", self.name);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests;
