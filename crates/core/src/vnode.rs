//! The vnode: authoritative per-partition replica.
//!
//! One task per vnode processes its mailbox sequentially, so writes to a
//! key are totally ordered by arrival and a read sees every write queued
//! before it. The vnode owns its storage namespace, its Merkle tree and
//! its node clock; nothing else touches them.
//!
//! On every open the persisted epoch is incremented, giving the vnode a
//! fresh `(partition, epoch)` identity. Dots issued after a restart can
//! therefore never collide with pre-crash dots still in flight elsewhere.
//! This is a correctness requirement, not bookkeeping.

use crate::codec::{decode_object, encode_object};
use crate::dvv::{Dvv, Value, VersionVector};
use crate::error::ErrorKind;
use crate::hashtree::{object_hash, HashTree};
use crate::msg::{ReplicaReply, TreeAnswer, TreeQuery, VnodeHandle, VnodeMsg, VnodeStats};
use dotkv_common::{Bkey, VnodeId};
use dotkv_storage::{open_with_retry, OrderedStore, RetryPolicy, StorageError};
use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;

/// Storage-key prefix for user data.
const DATA_PREFIX: u8 = b'd';
/// Storage key holding the persisted epoch.
const EPOCH_KEY: &[u8] = b"m/epoch";
/// Keys folded into the tree per build step.
const BUILD_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct VnodeConfig {
    /// Merkle tree branching factor B.
    pub tree_children: usize,
    /// Probability of dropping an inbound write (fault injection,
    /// 0 in production).
    pub fail_ratio: f64,
    /// Mailbox depth before senders see overload.
    pub mailbox_capacity: usize,
    /// Backoff between storage open retries.
    pub open_backoff: Duration,
}

impl Default for VnodeConfig {
    fn default() -> Self {
        Self {
            tree_children: 10,
            fail_ratio: 0.0,
            mailbox_capacity: 1024,
            open_backoff: RetryPolicy::OPEN.backoff,
        }
    }
}

pub struct Vnode {
    id: VnodeId,
    store: Box<dyn OrderedStore>,
    tree: HashTree,
    node_clock: VersionVector,
    stats: VnodeStats,
    fail_ratio: f64,
    partitioned: bool,
    rx: mpsc::Receiver<VnodeMsg>,
    /// Held only while the initial tree fold is in flight, so the task
    /// can message itself; dropped once built to let the channel close.
    self_tx: Option<mpsc::Sender<VnodeMsg>>,
    build_queue: VecDeque<Vec<u8>>,
}

impl Vnode {
    /// Open the vnode's namespace (with lock-retry), bump the epoch and
    /// start the worker task. The initial Merkle fold runs inside the
    /// task in steps; exchanges are refused until it completes.
    pub fn spawn(
        index: u32,
        namespace: &str,
        config: VnodeConfig,
    ) -> Result<VnodeHandle, StorageError> {
        let policy = RetryPolicy::OPEN.with_backoff(config.open_backoff);
        let mut store = open_with_retry(namespace, policy)?;

        let epoch = next_epoch(&mut store)?;
        let id = VnodeId::new(index, epoch);

        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let handle = VnodeHandle::new(index, tx.clone());

        let mut build_queue = VecDeque::new();
        store.fold_keys(&mut |key| {
            if key.first() == Some(&DATA_PREFIX) {
                build_queue.push_back(key.to_vec());
            }
        })?;

        let vnode = Vnode {
            id,
            store: Box::new(store),
            tree: HashTree::new(config.tree_children),
            node_clock: VersionVector::new(),
            stats: VnodeStats::default(),
            fail_ratio: config.fail_ratio,
            partitioned: false,
            rx,
            self_tx: Some(tx),
            build_queue,
        };

        tracing::info!(vnode = %id, keys = vnode.build_queue.len(), "vnode starting");
        tokio::spawn(async move {
            let mut vnode = vnode;
            vnode.kick_build();
            vnode.run().await;
        });

        Ok(handle)
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                VnodeMsg::Read { reqid, bkey, reply } => {
                    if self.partitioned {
                        continue;
                    }
                    self.stats.reads += 1;
                    let response = match self.load(&bkey) {
                        Ok(Some(object)) => ReplicaReply::ReadOk {
                            reqid,
                            from: self.id,
                            object: Box::new(object),
                        },
                        Ok(None) => ReplicaReply::Error {
                            reqid,
                            from: self.id,
                            error: ErrorKind::NotFound,
                        },
                        Err(error) => ReplicaReply::Error {
                            reqid,
                            from: self.id,
                            error,
                        },
                    };
                    let _ = reply.try_send(response);
                }
                VnodeMsg::Write {
                    reqid,
                    bkey,
                    ctx,
                    value,
                    reply,
                } => {
                    if self.partitioned {
                        continue;
                    }
                    if self.fail_ratio > 0.0
                        && rand::thread_rng().gen_bool(self.fail_ratio.min(1.0))
                    {
                        tracing::debug!(vnode = %self.id, key = %bkey, "dropping write (fail ratio)");
                        continue;
                    }
                    let response = match self.apply_write(&bkey, &ctx, value) {
                        Ok(context) => ReplicaReply::WriteOk {
                            reqid,
                            from: self.id,
                            context,
                        },
                        Err(error) => ReplicaReply::Error {
                            reqid,
                            from: self.id,
                            error,
                        },
                    };
                    let _ = reply.try_send(response);
                }
                VnodeMsg::Repair { bkey, object } => {
                    if self.partitioned {
                        continue;
                    }
                    if let Err(error) = self.apply_repair(&bkey, *object) {
                        tracing::warn!(vnode = %self.id, key = %bkey, %error, "repair failed");
                    }
                }
                VnodeMsg::Tree { query, reply } => {
                    if self.partitioned {
                        continue;
                    }
                    self.stats.tree_queries += 1;
                    let _ = reply.send(self.answer_tree(query));
                }
                VnodeMsg::Stats { reply } => {
                    let _ = reply.send(self.stats);
                }
                VnodeMsg::SetPartitioned(on) => {
                    self.partitioned = on;
                }
                VnodeMsg::BuildStep => {
                    self.build_step();
                }
                VnodeMsg::Shutdown => break,
            }
        }
        tracing::info!(vnode = %self.id, "vnode stopped");
    }

    // -----------------------------------------------------------------------
    // Data path
    // -----------------------------------------------------------------------

    fn load(&self, bkey: &Bkey) -> Result<Option<Dvv>, ErrorKind> {
        let key = data_key(bkey);
        match self.store.get(&key) {
            Ok(None) => Ok(None),
            Ok(Some(bytes)) => decode_object(&bytes).map(Some).map_err(|e| {
                tracing::error!(vnode = %self.id, key = %bkey, %e, "corrupt object");
                ErrorKind::Storage(dotkv_storage::StorageKind::Corrupt)
            }),
            Err(e) => Err(ErrorKind::from(&e)),
        }
    }

    fn persist(&mut self, bkey: &Bkey, object: &Dvv) -> Result<(), ErrorKind> {
        let key = data_key(bkey);
        let encoded = encode_object(object);
        self.store
            .put(&key, &encoded)
            .map_err(|e| ErrorKind::from(&e))?;
        self.tree.insert(&key, object_hash(&encoded));
        Ok(())
    }

    fn apply_write(
        &mut self,
        bkey: &Bkey,
        ctx: &VersionVector,
        value: Value,
    ) -> Result<VersionVector, ErrorKind> {
        self.stats.writes += 1;
        let current = self.load(bkey)?.unwrap_or_default();
        let updated = current.update(ctx, value, self.id);
        self.persist(bkey, &updated)?;
        let context = updated.join();
        self.node_clock.merge(&context);
        Ok(context)
    }

    fn apply_repair(&mut self, bkey: &Bkey, incoming: Dvv) -> Result<(), ErrorKind> {
        let local = self.load(bkey)?.unwrap_or_default();
        let merged = local.sync(&incoming);
        if merged != local {
            self.persist(bkey, &merged)?;
            self.stats.repairs += 1;
            self.node_clock.merge(&merged.join());
            dotkv_metrics::metrics().keys_repaired.inc();
            tracing::debug!(vnode = %self.id, key = %bkey, "repaired stale object");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Hashtree
    // -----------------------------------------------------------------------

    fn answer_tree(&self, query: TreeQuery) -> Result<TreeAnswer, ErrorKind> {
        if !self.tree.is_built() {
            return Err(ErrorKind::NotReady);
        }
        match query {
            TreeQuery::Root => Ok(TreeAnswer::Hash(self.tree.root_hash())),
            TreeQuery::Branches => Ok(TreeAnswer::Hashes(self.tree.branch_hashes())),
            TreeQuery::Leaves { branch } => {
                if branch >= self.tree.children() {
                    return Err(ErrorKind::NotFound);
                }
                Ok(TreeAnswer::Hashes(self.tree.leaf_hashes(branch)))
            }
            TreeQuery::LeafKeys { leaf } => {
                if leaf >= self.tree.leaf_count() {
                    return Err(ErrorKind::NotFound);
                }
                let keys = self
                    .tree
                    .keys_in_leaf(leaf)
                    .iter()
                    .filter_map(|enc| Bkey::decode(&enc[1..]))
                    .collect();
                Ok(TreeAnswer::Keys(keys))
            }
        }
    }

    fn kick_build(&mut self) {
        if self.build_queue.is_empty() {
            self.finish_build();
        } else {
            self.build_step();
        }
    }

    /// Fold one batch of keys into the tree, then re-enqueue ourselves so
    /// reads and writes interleave with a long initial fold.
    fn build_step(&mut self) {
        for _ in 0..BUILD_BATCH {
            let Some(key) = self.build_queue.pop_front() else {
                self.finish_build();
                return;
            };
            match self.store.get(&key) {
                Ok(Some(bytes)) => self.tree.insert(&key, object_hash(&bytes)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(vnode = %self.id, %e, "skipping key during tree build");
                }
            }
        }
        if self.build_queue.is_empty() {
            self.finish_build();
            return;
        }
        let delivered = self
            .self_tx
            .as_ref()
            .map(|tx| tx.try_send(VnodeMsg::BuildStep).is_ok())
            .unwrap_or(false);
        if !delivered {
            // Mailbox full; drain the remainder inline rather than stall.
            while let Some(key) = self.build_queue.pop_front() {
                if let Ok(Some(bytes)) = self.store.get(&key) {
                    self.tree.insert(&key, object_hash(&bytes));
                }
            }
            self.finish_build();
        }
    }

    fn finish_build(&mut self) {
        if !self.tree.is_built() {
            self.tree.mark_built();
            self.self_tx = None;
            tracing::debug!(vnode = %self.id, "merkle tree built");
        }
    }
}

/// Storage key for a bkey: data prefix plus the serialized pair.
fn data_key(bkey: &Bkey) -> Vec<u8> {
    let encoded = bkey.encode();
    let mut key = Vec::with_capacity(1 + encoded.len());
    key.push(DATA_PREFIX);
    key.extend_from_slice(&encoded);
    key
}

/// Load, increment and persist the epoch. Runs before the vnode serves
/// anything, so the new identity is durable first.
fn next_epoch(store: &mut impl OrderedStore) -> Result<u32, StorageError> {
    let previous = match store.get(EPOCH_KEY)? {
        None => 0,
        Some(bytes) => {
            let raw: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| StorageError::Corrupt("epoch key".into()))?;
            u32::from_le_bytes(raw)
        }
    };
    let epoch = previous + 1;
    store.put(EPOCH_KEY, &epoch.to_le_bytes())?;
    Ok(epoch)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
