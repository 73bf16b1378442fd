//! Outbound state machine: drive one closed version to the server.

use crate::config::SyncConfig;
use crate::crypto::{SignedVerhash, Verhash};
use crate::transfer::messages::{Cursor, PushRequest, Request, Response};
use crate::transfer::transport::Transport;
use crate::versions::{DeltaEntry, Version};
use crate::{Result, SyncError};
use tracing::{debug, info, warn};

/// How a push ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The server installed the pushed version.
    Success { server_version: SignedVerhash },
    /// The server moved on; pull, merge and push again.
    OutOfDate { server_version: Option<SignedVerhash> },
    /// The server refused the seqnum; handled like `OutOfDate`.
    BadSeqnum { server_version: Option<SignedVerhash> },
}

#[derive(Debug)]
enum PushState {
    /// Next batch starts at this index of the delta
    Sending(usize),
    Done(PushOutcome),
}

pub struct Pusher<'a, T: Transport + ?Sized> {
    transport: &'a T,
    from: Option<Verhash>,
    to: SignedVerhash,
    deltas: Vec<DeltaEntry>,
    batch_size: usize,
    max_restarts: u32,
}

impl<'a, T: Transport + ?Sized> Pusher<'a, T> {
    /// Precompute the delta from `old` (or from nothing) to `new_version`.
    pub fn new(
        new_version: &Version,
        old: Option<&Version>,
        transport: &'a T,
        config: &SyncConfig,
    ) -> Result<Self> {
        Ok(Self {
            transport,
            from: old.map(|v| v.verhash().clone()),
            to: new_version.signed_verhash()?,
            deltas: new_version.create_delta_from(old),
            batch_size: config.push_batch_size.max(1),
            max_restarts: config.max_restarts,
        })
    }

    pub async fn run(self) -> Result<PushOutcome> {
        let mut state = PushState::Sending(0);
        let mut restarts = 0;

        loop {
            let offset = match state {
                PushState::Sending(offset) => offset,
                PushState::Done(outcome) => return Ok(outcome),
            };

            let end = (offset + self.batch_size).min(self.deltas.len());
            let first = if offset == 0 {
                Cursor::Start
            } else {
                Cursor::at(&self.deltas, offset, Cursor::End)
            };
            let upto = Cursor::at(&self.deltas, end, Cursor::End);
            debug!(
                "Push {} batch [{}..{}) of {}",
                self.to,
                offset,
                end,
                self.deltas.len()
            );

            let request = Request::Push(PushRequest {
                from: self.from.clone(),
                to: self.to.clone(),
                first,
                upto,
                batch: self.deltas[offset..end].to_vec(),
            });

            state = match self.transport.send(request).await? {
                Response::Ok { .. } if end >= self.deltas.len() => {
                    info!("Pushed version {}", self.to);
                    PushState::Done(PushOutcome::Success {
                        server_version: self.to.clone(),
                    })
                }
                Response::Ok { .. } => PushState::Sending(end),
                Response::OutOfDate { server_version } => {
                    warn!("Push of {} is out of date", self.to);
                    PushState::Done(PushOutcome::OutOfDate { server_version })
                }
                Response::BadSeqnum { server_version } => {
                    warn!("Push of {} rejected for seqnum", self.to);
                    PushState::Done(PushOutcome::BadSeqnum { server_version })
                }
                Response::MissingKeys => {
                    restarts += 1;
                    if restarts > self.max_restarts {
                        return Err(SyncError::Protocol(format!(
                            "Push gave up after {} missing-keys restarts",
                            self.max_restarts
                        )));
                    }
                    warn!("Server lost partial push of {}, restarting", self.to);
                    PushState::Sending(0)
                }
                other => {
                    return Err(SyncError::Protocol(format!(
                        "Unexpected {} response to push",
                        other.kind()
                    )));
                }
            };
        }
    }
}

/// Push `new_version` on top of `old`.
pub async fn push<T: Transport + ?Sized>(
    new_version: &Version,
    old: Option<&Version>,
    transport: &T,
    config: &SyncConfig,
) -> Result<PushOutcome> {
    Pusher::new(new_version, old, transport, config)?.run().await
}
