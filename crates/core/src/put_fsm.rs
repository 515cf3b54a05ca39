//! Put coordinator: drives one write (or delete) across the replica set.
//!
//! An explicit tagged state machine: `Execute → Waiting`. Every replica
//! receives the same `(ctx, value)` and assigns its own local dot;
//! convergence across the resulting siblings happens later, on read or
//! through anti-entropy. A delete is the same write with the tombstone
//! sentinel.

use crate::dvv::{Value, VersionVector};
use crate::error::ErrorKind;
use crate::msg::{ReplicaReply, ReqId, VnodeHandle, VnodeMsg};
use dotkv_common::Bkey;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PutOptions {
    /// Minimum successful replica writes before the client sees ok.
    pub w: usize,
    pub timeout: Duration,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            w: 2,
            timeout: Duration::from_millis(20_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutReply {
    Ok,
    Error(ErrorKind),
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutState {
    Execute,
    Waiting,
}

pub struct PutCoordinator {
    reqid: ReqId,
    bkey: Bkey,
    ctx: VersionVector,
    value: Value,
    replicas: Vec<VnodeHandle>,
    opts: PutOptions,
    state: PutState,
    /// `None` for fire-and-forget (`no_reply`) writes.
    client: Option<oneshot::Sender<PutReply>>,
}

impl PutCoordinator {
    /// Spawn the coordinator and return the client reply channel.
    pub fn spawn(
        bkey: Bkey,
        ctx: VersionVector,
        value: Value,
        replicas: Vec<VnodeHandle>,
        opts: PutOptions,
    ) -> oneshot::Receiver<PutReply> {
        let (client_tx, client_rx) = oneshot::channel();
        Self::start(bkey, ctx, value, replicas, opts, Some(client_tx));
        client_rx
    }

    /// Fire-and-forget variant: no client reply is ever produced.
    pub fn spawn_no_reply(
        bkey: Bkey,
        ctx: VersionVector,
        value: Value,
        replicas: Vec<VnodeHandle>,
        opts: PutOptions,
    ) {
        Self::start(bkey, ctx, value, replicas, opts, None);
    }

    fn start(
        bkey: Bkey,
        ctx: VersionVector,
        value: Value,
        replicas: Vec<VnodeHandle>,
        opts: PutOptions,
        client: Option<oneshot::Sender<PutReply>>,
    ) {
        let fsm = PutCoordinator {
            reqid: Uuid::new_v4(),
            bkey,
            ctx,
            value,
            replicas,
            opts,
            state: PutState::Execute,
            client,
        };
        tokio::spawn(fsm.run());
    }

    async fn run(mut self) {
        debug_assert_eq!(self.state, PutState::Execute);
        let n = self.replicas.len();
        let w = self.opts.w.clamp(1, n.max(1));

        let (reply_tx, mut reply_rx) = mpsc::channel(n.max(1));
        let mut seen: Vec<u32> = Vec::with_capacity(n);
        let mut good = 0usize;
        let mut failed = 0usize;
        let mut last_error: Option<ErrorKind> = None;

        for replica in &self.replicas {
            let dispatched = replica.deliver(VnodeMsg::Write {
                reqid: self.reqid,
                bkey: self.bkey.clone(),
                ctx: self.ctx.clone(),
                value: self.value.clone(),
                reply: reply_tx.clone(),
            });
            if let Err(e) = dispatched {
                tracing::debug!(partition = replica.index, error = %e, "write dispatch failed");
                seen.push(replica.index);
                failed += 1;
                last_error = Some(e);
            }
        }
        drop(reply_tx);

        self.state = PutState::Waiting;
        let deadline = Instant::now() + self.opts.timeout;

        loop {
            let reply = tokio::select! {
                reply = reply_rx.recv() => reply,
                _ = tokio::time::sleep_until(deadline) => {
                    self.shortfall(last_error);
                    return;
                }
            };

            let Some(reply) = reply else {
                // No outstanding reply sender left: the acks are final.
                self.shortfall(last_error);
                return;
            };

            if reply.reqid() != self.reqid {
                continue;
            }
            let index = reply.from().index;
            if seen.contains(&index) {
                continue;
            }
            seen.push(index);

            match reply {
                ReplicaReply::WriteOk { .. } => good += 1,
                ReplicaReply::Error { error, .. } => {
                    failed += 1;
                    last_error = Some(error);
                }
                ReplicaReply::ReadOk { .. } => continue,
            }

            if good >= w {
                self.answer(PutReply::Ok);
            }
            if good + failed >= n {
                // All replicas accounted for.
                self.shortfall(last_error);
                return;
            }
        }
    }

    /// Close out a request whose quorum may not have been met. The
    /// client (if still unanswered) gets the last replica error when one
    /// was observed, otherwise timeout.
    fn shortfall(&mut self, last_error: Option<ErrorKind>) {
        let reply = match last_error {
            Some(error) => PutReply::Error(error),
            None => PutReply::Timeout,
        };
        self.answer(reply);
    }

    fn answer(&mut self, reply: PutReply) {
        if let Some(client) = self.client.take() {
            let _ = client.send(reply);
        }
    }
}
