//! Server-side coordinator.
//!
//! One `Server` serves one dataset. It holds ciphertext only, accumulates
//! partial pushes per target pointer, installs completed pushes through the
//! compare-and-swap [`CurrentVersion`] slot and paginates pulls.
//!
//! Accumulators live in memory only. After a restart (or after pruning) a
//! client continuing a push is told `missing-keys` and starts over.

mod current;

pub use current::{CasOutcome, CurrentVersion};

use crate::config::SyncConfig;
use crate::crypto::{parse_version_pointer, SignedVerhash, Verhash};
use crate::transfer::messages::{Cursor, PullRequest, PushRequest, Request, Response};
use crate::versions::{DeltaEntry, KevMap, ServerVersion, ServerVersionStore};
use crate::Result;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Deltas received so far for one pushed target.
#[derive(Debug)]
struct Accumulator {
    deltas: Vec<DeltaEntry>,
    expected_next: Cursor,
    touched: Instant,
}

/// Snapshot of the coordinator for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub current: Option<SignedVerhash>,
    pub seqnum: Option<u64>,
    pub entries: usize,
    pub stored_versions: usize,
    pub pending_pushes: usize,
}

struct ServerInner {
    config: SyncConfig,
    store: ServerVersionStore,
    current: CurrentVersion,
    accumulators: Mutex<HashMap<SignedVerhash, Accumulator>>,
    retained: Mutex<VecDeque<Arc<ServerVersion>>>,
}

/// Message dispatcher for one dataset. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

impl Server {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                store: ServerVersionStore::new(),
                current: CurrentVersion::new(),
                accumulators: Mutex::new(HashMap::new()),
                retained: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ServerVersionStore {
        &self.inner.store
    }

    pub async fn current(&self) -> Option<Arc<ServerVersion>> {
        self.inner.current.current().await
    }

    /// Handle one protocol request.
    ///
    /// Recoverable conditions come back as response variants. An `Err`
    /// means the request itself was unusable (malformed pointer, pushed
    /// content that does not hash to its pointer).
    pub async fn message_received(&self, request: Request) -> Result<Response> {
        match request {
            Request::Push(push) => self.handle_push(push).await,
            Request::Pull(pull) => self.handle_pull(pull).await,
        }
    }

    async fn handle_push(&self, req: PushRequest) -> Result<Response> {
        let current = self.current().await;
        let current_verhash = current.as_ref().map(|v| v.verhash().clone());
        if req.from != current_verhash {
            debug!("Push to {} is based on a stale version", req.to);
            return Ok(Response::OutOfDate {
                server_version: current.map(|v| v.signed_verhash().clone()),
            });
        }

        let pointer = parse_version_pointer(&req.to)?;
        if self.inner.config.enforce_monotonic_seqnum {
            if let Some(cur) = &current {
                if pointer.seqnum <= cur.seqnum() {
                    warn!(
                        "Rejecting push of seqnum {} over seqnum {}",
                        pointer.seqnum,
                        cur.seqnum()
                    );
                    return Ok(Response::BadSeqnum {
                        server_version: Some(cur.signed_verhash().clone()),
                    });
                }
            }
        }

        let deltas = {
            let mut accumulators = self.inner.accumulators.lock().await;
            if req.first == Cursor::Start {
                accumulators.insert(
                    req.to.clone(),
                    Accumulator {
                        deltas: Vec::new(),
                        expected_next: Cursor::Start,
                        touched: Instant::now(),
                    },
                );
            }

            let Some(acc) = accumulators.get_mut(&req.to) else {
                debug!("No partial push for {}", req.to);
                return Ok(Response::MissingKeys);
            };
            if acc.expected_next != req.first {
                debug!(
                    "Push for {} expected {}, got {}",
                    req.to, acc.expected_next, req.first
                );
                return Ok(Response::MissingKeys);
            }

            acc.deltas.extend(req.batch);
            acc.expected_next = req.upto.clone();
            acc.touched = Instant::now();

            if req.upto != Cursor::End {
                return Ok(Response::ok());
            }
            match accumulators.remove(&req.to) {
                Some(acc) => acc.deltas,
                None => return Ok(Response::MissingKeys),
            }
        };

        self.apply_delta(req.from.as_ref(), &req.to, &deltas).await
    }

    /// Build the pushed version from its base, verify it, and CAS it in.
    pub async fn apply_delta(
        &self,
        from: Option<&Verhash>,
        to: &SignedVerhash,
        deltas: &[DeltaEntry],
    ) -> Result<Response> {
        let current = self.current().await;
        let base = match from {
            Some(verhash) => match current.filter(|c| c.verhash() == verhash) {
                Some(current) => Some(current),
                None => match self.inner.store.get_version(verhash) {
                    Some(base) => Some(base),
                    None => {
                        return Ok(Response::OutOfDate {
                            server_version: self.current_pointer().await,
                        });
                    }
                },
            },
            None => None,
        };

        let mut builder = match &base {
            Some(base) => base.next_version(to)?,
            None => self.inner.store.create_new_version(to)?,
        };
        builder.apply(deltas);
        let version = builder.close()?;

        match self.inner.current.update_version(from, version.clone()).await {
            CasOutcome::Installed { previous } => {
                self.inner.store.promote(&version);
                info!(
                    "Installed version seqnum={} ({} entries)",
                    version.seqnum(),
                    version.len()
                );
                if let Some(previous) = previous {
                    self.retain(previous).await;
                }
                Ok(Response::ok())
            }
            CasOutcome::Conflict { current } => {
                warn!("Lost the race installing {}", to);
                self.inner.store.free(&version);
                Ok(Response::OutOfDate {
                    server_version: current.map(|v| v.signed_verhash().clone()),
                })
            }
        }
    }

    /// Keep `superseded` as a delta base, freeing the oldest beyond the limit.
    async fn retain(&self, superseded: Arc<ServerVersion>) {
        let mut retained = self.inner.retained.lock().await;
        retained.push_back(superseded);
        while retained.len() > self.inner.config.retained_versions {
            if let Some(old) = retained.pop_front() {
                self.inner.store.free(&old);
            }
        }
    }

    async fn handle_pull(&self, req: PullRequest) -> Result<Response> {
        let Some(current) = self.current().await else {
            return Ok(Response::UnknownDelta {
                server_version: None,
            });
        };
        if req.to != *current.signed_verhash() {
            return Ok(Response::UnknownDelta {
                server_version: Some(current.signed_verhash().clone()),
            });
        }

        let base = match &req.from {
            Some(verhash) => match self.inner.store.get_version(verhash) {
                Some(base) => Some(base),
                None => {
                    return Ok(Response::UnknownDelta {
                        server_version: Some(current.signed_verhash().clone()),
                    });
                }
            },
            None => None,
        };

        let deltas = current.create_delta_from(base.as_deref());
        let start = match &req.first {
            Cursor::Start => 0,
            Cursor::Key(key) => match deltas.iter().position(|d| &d.key == key) {
                Some(index) => index,
                None => return Ok(Response::MissingKeys),
            },
            _ => return Ok(Response::MissingKeys),
        };

        let end = (start + self.inner.config.pull_batch_size.max(1)).min(deltas.len());
        let next = Cursor::at(&deltas, end, Cursor::Done);
        debug!("Pull page [{}..{}) of {} -> {}", start, end, deltas.len(), next);
        Ok(Response::page(deltas[start..end].to_vec(), next))
    }

    async fn current_pointer(&self) -> Option<SignedVerhash> {
        self.current().await.map(|v| v.signed_verhash().clone())
    }

    /// Install a version restored from persistence, bypassing CAS.
    pub async fn restore(&self, signed: &SignedVerhash, kevs: KevMap) -> Result<()> {
        let mut builder = self.inner.store.create_new_version(signed)?;
        for (key, ciphertext) in kevs {
            builder.set_kev(key, ciphertext);
        }
        let version = builder.close()?;
        self.inner.store.promote(&version);
        info!(
            "Restored version seqnum={} ({} entries)",
            version.seqnum(),
            version.len()
        );
        if let Some(previous) = self.inner.current.replace_version(version).await {
            self.retain(previous).await;
        }
        Ok(())
    }

    /// Drop partial pushes idle for longer than `max_age`.
    pub async fn prune_accumulators(&self, max_age: Duration) -> usize {
        let mut accumulators = self.inner.accumulators.lock().await;
        let before = accumulators.len();
        accumulators.retain(|_, acc| acc.touched.elapsed() <= max_age);
        let pruned = before - accumulators.len();
        if pruned > 0 {
            info!("Pruned {} stale partial pushes", pruned);
        }
        pruned
    }

    pub async fn status(&self) -> ServerStatus {
        let current = self.current().await;
        let pending_pushes = self.inner.accumulators.lock().await.len();
        ServerStatus {
            seqnum: current.as_ref().map(|v| v.seqnum()),
            entries: current.as_ref().map(|v| v.len()).unwrap_or(0),
            current: current.map(|v| v.signed_verhash().clone()),
            stored_versions: self.inner.store.len(),
            pending_pushes,
        }
    }
}
