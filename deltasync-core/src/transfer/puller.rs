//! Inbound state machine: fetch and verify the version a pointer names.

use crate::config::SyncConfig;
use crate::crypto::SignedVerhash;
use crate::transfer::messages::{Cursor, PullRequest, Request, Response};
use crate::transfer::transport::Transport;
use crate::versions::{DeltaOp, NewVersion, Version, VersionStore};
use crate::{Result, SyncError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a pull ended.
#[derive(Debug)]
pub enum PullOutcome {
    /// The target was fetched, verified and registered.
    Success { version: Arc<Version> },
    /// The server no longer offers the target.
    OutOfDate { server_version: Option<SignedVerhash> },
}

enum PullState {
    Fetching(Cursor),
    /// Start over, optionally abandoning the delta base
    Restart { drop_base: bool },
    Done(PullOutcome),
}

pub struct Puller<'a, T: Transport + ?Sized> {
    transport: &'a T,
    store: &'a VersionStore,
    target: SignedVerhash,
    base: Option<Arc<Version>>,
    max_restarts: u32,
}

impl<'a, T: Transport + ?Sized> Puller<'a, T> {
    pub fn new(
        target: SignedVerhash,
        base: Option<Arc<Version>>,
        store: &'a VersionStore,
        transport: &'a T,
        config: &SyncConfig,
    ) -> Self {
        Self {
            transport,
            store,
            target,
            base,
            max_restarts: config.max_restarts,
        }
    }

    /// A builder bound to the target, seeded from the base if there is one.
    fn builder(&self) -> Result<NewVersion> {
        match &self.base {
            Some(base) => base.create_new_version(&self.target),
            None => self.store.create_new_version(&self.target),
        }
    }

    pub async fn run(mut self) -> Result<PullOutcome> {
        let mut builder = self.builder()?;
        let mut state = PullState::Fetching(Cursor::Start);
        let mut restarts = 0;

        loop {
            let cursor = match state {
                PullState::Fetching(cursor) => cursor,
                PullState::Restart { drop_base } => {
                    restarts += 1;
                    if restarts > self.max_restarts {
                        return Err(SyncError::Protocol(format!(
                            "Pull gave up after {} restarts",
                            self.max_restarts
                        )));
                    }
                    if drop_base {
                        self.base = None;
                    }
                    builder = self.builder()?;
                    Cursor::Start
                }
                PullState::Done(outcome) => return Ok(outcome),
            };

            debug!("Pull {} from {}", self.target, cursor);
            let request = Request::Pull(PullRequest {
                from: self.base.as_ref().map(|b| b.verhash().clone()),
                to: self.target.clone(),
                first: cursor,
            });

            state = match self.transport.send(request).await? {
                Response::Ok {
                    deltas: Some(deltas),
                    next: Some(next),
                } => {
                    for delta in deltas {
                        match delta.op {
                            DeltaOp::Set(ct) => builder.set_kev(delta.key, ct),
                            DeltaOp::Delete => builder.delete_key(&delta.key),
                        }
                    }
                    match next {
                        Cursor::Done => {
                            let version = builder.close()?;
                            info!("Pulled version {}", self.target);
                            return Ok(PullOutcome::Success { version });
                        }
                        Cursor::Key(key) => PullState::Fetching(Cursor::Key(key)),
                        other => {
                            return Err(SyncError::Protocol(format!(
                                "Invalid pull continuation {}",
                                other
                            )));
                        }
                    }
                }
                Response::UnknownDelta { server_version } => {
                    if self.base.is_none() {
                        warn!("Server no longer offers {}", self.target);
                        PullState::Done(PullOutcome::OutOfDate { server_version })
                    } else {
                        warn!("Server has no delta for our base, falling back to full snapshot");
                        PullState::Restart { drop_base: true }
                    }
                }
                Response::MissingKeys => {
                    warn!("Server rejected pull cursor, restarting");
                    PullState::Restart { drop_base: false }
                }
                other => {
                    return Err(SyncError::Protocol(format!(
                        "Unexpected {} response to pull",
                        other.kind()
                    )));
                }
            };
        }
    }
}

/// Fetch the version `target` names, using `base` as a delta base if given.
pub async fn pull<T: Transport + ?Sized>(
    target: &SignedVerhash,
    base: Option<Arc<Version>>,
    store: &VersionStore,
    transport: &T,
    config: &SyncConfig,
) -> Result<PullOutcome> {
    Puller::new(target.clone(), base, store, transport, config)
        .run()
        .await
}
