//! Messages exchanged between entities.
//!
//! Every entity (vnode, coordinator, exchange) is a serial task with a
//! mailbox; these are the only things that cross between them. Replies
//! carry the request id so a coordinator can discard responses that
//! belong to a finished request.

use crate::dvv::{Dvv, Value, VersionVector};
use crate::error::ErrorKind;
use crate::hashtree::TreeHash;
use dotkv_common::{Bkey, VnodeId};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Request identifier used to demultiplex replies inside coordinators.
pub type ReqId = Uuid;

/// Per-vnode operation counters, snapshotted on request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VnodeStats {
    pub reads: u64,
    pub writes: u64,
    pub repairs: u64,
    pub tree_queries: u64,
}

/// Inbound messages a vnode processes sequentially.
#[derive(Debug)]
pub enum VnodeMsg {
    /// Load the object for a key and reply to the coordinator.
    Read {
        reqid: ReqId,
        bkey: Bkey,
        reply: mpsc::Sender<ReplicaReply>,
    },
    /// Apply a client write (or delete, as a tombstone) and reply.
    Write {
        reqid: ReqId,
        bkey: Bkey,
        ctx: VersionVector,
        value: Value,
        reply: mpsc::Sender<ReplicaReply>,
    },
    /// Merge a reconciled object into local state. No reply.
    Repair { bkey: Bkey, object: Box<Dvv> },
    /// Hashtree query from an exchange.
    Tree {
        query: TreeQuery,
        reply: oneshot::Sender<Result<TreeAnswer, ErrorKind>>,
    },
    /// Snapshot operation counters.
    Stats { reply: oneshot::Sender<VnodeStats> },
    /// Test harness: emulate a network partition. While set, all data
    /// traffic is dropped on the floor.
    SetPartitioned(bool),
    /// Internal: continue the initial tree fold.
    BuildStep,
    /// Stop the vnode, releasing its storage handle.
    Shutdown,
}

/// Hashtree queries used by the exchange protocol, top-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeQuery {
    Root,
    /// The B hashes of the root's internal children.
    Branches,
    /// The B leaf hashes under one internal node.
    Leaves { branch: usize },
    /// The keys in one leaf bucket.
    LeafKeys { leaf: usize },
}

#[derive(Debug, Clone)]
pub enum TreeAnswer {
    Hash(TreeHash),
    Hashes(Vec<TreeHash>),
    Keys(Vec<Bkey>),
}

/// A vnode's answer to a read or write.
#[derive(Debug)]
pub enum ReplicaReply {
    ReadOk {
        reqid: ReqId,
        from: VnodeId,
        object: Box<Dvv>,
    },
    WriteOk {
        reqid: ReqId,
        from: VnodeId,
        context: VersionVector,
    },
    Error {
        reqid: ReqId,
        from: VnodeId,
        error: ErrorKind,
    },
}

impl ReplicaReply {
    pub fn reqid(&self) -> ReqId {
        match self {
            ReplicaReply::ReadOk { reqid, .. }
            | ReplicaReply::WriteOk { reqid, .. }
            | ReplicaReply::Error { reqid, .. } => *reqid,
        }
    }

    pub fn from(&self) -> VnodeId {
        match self {
            ReplicaReply::ReadOk { from, .. }
            | ReplicaReply::WriteOk { from, .. }
            | ReplicaReply::Error { from, .. } => *from,
        }
    }
}

/// Address of a vnode: its partition index plus the mailbox sender.
///
/// The epoch is deliberately absent; it changes on restart while the
/// mailbox address stays stable for the owner.
#[derive(Debug, Clone)]
pub struct VnodeHandle {
    pub index: u32,
    tx: mpsc::Sender<VnodeMsg>,
}

impl VnodeHandle {
    pub fn new(index: u32, tx: mpsc::Sender<VnodeMsg>) -> Self {
        Self { index, tx }
    }

    /// Enqueue without waiting. A full mailbox reports
    /// [`ErrorKind::Overload`], a closed one [`ErrorKind::NotReady`].
    pub fn deliver(&self, msg: VnodeMsg) -> Result<(), ErrorKind> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ErrorKind::Overload,
            mpsc::error::TrySendError::Closed(_) => ErrorKind::NotReady,
        })
    }

    pub async fn stats(&self) -> Option<VnodeStats> {
        let (tx, rx) = oneshot::channel();
        self.deliver(VnodeMsg::Stats { reply: tx }).ok()?;
        rx.await.ok()
    }
}
