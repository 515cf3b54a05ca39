//! Get coordinator: drives one read across the replica set to quorum.
//!
//! An explicit tagged state machine, one per request:
//! `Execute → Waiting → Waiting2 → Finalize`. The client is answered as
//! soon as R replies are in; the coordinator then keeps collecting the
//! stragglers so finalize can compare every replica against the merged
//! result and dispatch read-repair to the stale ones.
//!
//! Replica errors and misses are normalized to an empty object: they
//! count toward the quorum with an empty clock, exactly as a replica
//! that has never seen the key.

use crate::dvv::Dvv;
use crate::msg::{ReplicaReply, ReqId, VnodeHandle, VnodeMsg};
use dotkv_common::Bkey;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Minimum replies before the client is answered.
    pub r: usize,
    /// Single wall-clock timer for the whole request.
    pub timeout: Duration,
    /// Dispatch repair writes to stale replicas in finalize.
    pub do_read_repair: bool,
    /// When false the client gets [`GetReply::Done`] with no values;
    /// used by the anti-entropy key-repair path.
    pub return_value: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            r: 2,
            timeout: Duration::from_millis(10_000),
            do_read_repair: true,
            return_value: true,
        }
    }
}

impl GetOptions {
    /// Two-vnode repair mode: min = max = 2, no client value.
    pub fn repair_mode(timeout: Duration) -> Self {
        Self {
            r: 2,
            timeout,
            do_read_repair: true,
            return_value: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetReply {
    Ok {
        values: Vec<Vec<u8>>,
        context: crate::dvv::VersionVector,
    },
    NotFound {
        context: crate::dvv::VersionVector,
    },
    /// Repair-mode acknowledgment, no value attached.
    Done,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GetState {
    Execute,
    Waiting,
    Waiting2,
    Finalize,
}

pub struct GetCoordinator {
    reqid: ReqId,
    bkey: Bkey,
    replicas: Vec<VnodeHandle>,
    opts: GetOptions,
    state: GetState,
    /// First reply per partition, in arrival order.
    replies: Vec<(u32, Dvv)>,
    client: Option<oneshot::Sender<GetReply>>,
}

impl GetCoordinator {
    /// Spawn the coordinator task. The caller awaits the returned
    /// channel for the client-visible reply.
    pub fn spawn(
        bkey: Bkey,
        replicas: Vec<VnodeHandle>,
        opts: GetOptions,
    ) -> oneshot::Receiver<GetReply> {
        let (client_tx, client_rx) = oneshot::channel();
        let fsm = GetCoordinator {
            reqid: Uuid::new_v4(),
            bkey,
            replicas,
            opts,
            state: GetState::Execute,
            replies: Vec::new(),
            client: Some(client_tx),
        };
        tokio::spawn(fsm.run());
        client_rx
    }

    async fn run(mut self) {
        debug_assert_eq!(self.state, GetState::Execute);
        let n = self.replicas.len();
        let r = self.opts.r.clamp(1, n.max(1));

        let (reply_tx, mut reply_rx) = mpsc::channel(n.max(1));
        let mut failed_indices = Vec::new();
        for replica in &self.replicas {
            let dispatched = replica.deliver(VnodeMsg::Read {
                reqid: self.reqid,
                bkey: self.bkey.clone(),
                reply: reply_tx.clone(),
            });
            if let Err(e) = dispatched {
                tracing::debug!(partition = replica.index, error = %e, "read dispatch failed");
                failed_indices.push(replica.index);
            }
        }
        for index in failed_indices {
            self.record(index, Dvv::new());
        }
        // Drop our clone so the channel closes once no replica can
        // answer anymore.
        drop(reply_tx);

        self.state = GetState::Waiting;
        // Synthetic replies for failed dispatches may already be quorum.
        self.advance(r, n);
        let deadline = Instant::now() + self.opts.timeout;

        while matches!(self.state, GetState::Waiting | GetState::Waiting2) {
            let reply = tokio::select! {
                reply = reply_rx.recv() => reply,
                _ = tokio::time::sleep_until(deadline) => {
                    if self.state == GetState::Waiting {
                        // Quorum missed: answer timeout and stop without
                        // repairing from a partial picture.
                        self.answer(GetReply::Timeout);
                        return;
                    }
                    self.state = GetState::Finalize;
                    break;
                }
            };

            let Some(reply) = reply else {
                // Every outstanding reply sender is gone; nothing more
                // can arrive, so the timer outcome is already known.
                if self.state == GetState::Waiting {
                    self.answer(GetReply::Timeout);
                    return;
                }
                self.state = GetState::Finalize;
                break;
            };

            if reply.reqid() != self.reqid {
                continue;
            }
            let index = reply.from().index;
            let object = match reply {
                ReplicaReply::ReadOk { object, .. } => *object,
                // Misses and storage errors read as an empty object.
                ReplicaReply::Error { .. } => Dvv::new(),
                ReplicaReply::WriteOk { .. } => continue,
            };
            if !self.record(index, object) {
                continue;
            }
            self.advance(r, n);
        }

        self.finalize();
    }

    /// Run the state transitions that depend on the reply count: answer
    /// the client at R, move on to finalize once every replica is in.
    fn advance(&mut self, r: usize, n: usize) {
        if self.state == GetState::Waiting && self.replies.len() >= r {
            let reply = self.client_reply();
            self.answer(reply);
            self.state = if self.replies.len() >= n {
                GetState::Finalize
            } else {
                GetState::Waiting2
            };
        } else if self.state == GetState::Waiting2 && self.replies.len() >= n {
            self.state = GetState::Finalize;
        }
    }

    /// Record the first reply per partition. Returns false on duplicates.
    fn record(&mut self, index: u32, object: Dvv) -> bool {
        if self.replies.iter().any(|(i, _)| *i == index) {
            return false;
        }
        self.replies.push((index, object));
        true
    }

    fn merged(&self) -> Dvv {
        self.replies
            .iter()
            .fold(Dvv::new(), |acc, (_, obj)| acc.sync(obj))
    }

    fn client_reply(&self) -> GetReply {
        if !self.opts.return_value {
            return GetReply::Done;
        }
        let merged = self.merged();
        let context = merged.join();
        let values: Vec<Vec<u8>> = merged.values().into_iter().map(|v| v.to_vec()).collect();
        if values.is_empty() {
            GetReply::NotFound { context }
        } else {
            GetReply::Ok { values, context }
        }
    }

    fn answer(&mut self, reply: GetReply) {
        if let Some(client) = self.client.take() {
            let _ = client.send(reply);
        }
    }

    fn finalize(mut self) {
        debug_assert_eq!(self.state, GetState::Finalize);
        if self.client.is_some() {
            let reply = self.client_reply();
            self.answer(reply);
        }
        if !self.opts.do_read_repair {
            return;
        }

        let merged = self.merged();
        let by_index: HashMap<u32, &VnodeHandle> =
            self.replicas.iter().map(|h| (h.index, h)).collect();

        let mut repaired = 0usize;
        for (index, object) in &self.replies {
            if !object.less(&merged) {
                continue;
            }
            let Some(handle) = by_index.get(index) else {
                continue;
            };
            let sent = handle.deliver(VnodeMsg::Repair {
                bkey: self.bkey.clone(),
                object: Box::new(merged.clone()),
            });
            if sent.is_ok() {
                repaired += 1;
            }
        }
        if repaired > 0 {
            dotkv_metrics::metrics().read_repairs.inc();
            tracing::debug!(
                key = %self.bkey,
                stale = repaired,
                "read repair dispatched"
            );
        }
    }
}
