//! Anti-entropy: periodic Merkle exchange between peer vnodes.
//!
//! Every tick one local vnode picks a preflist peer and the pair compare
//! trees top-down: root, then the B branch hashes, then the leaf hashes
//! under differing branches. Keys in differing leaves become candidates,
//! and each candidate is repaired by a two-vnode get coordinator in
//! repair mode, which syncs the pair and writes back whichever side was
//! stale.
//!
//! Concurrency controls: a token bucket caps outstanding hashtree
//! operations per vnode, and at most one exchange per vnode pair is in
//! flight; ticks landing on a busy pair are dropped.

use crate::error::ErrorKind;
use crate::get_fsm::{GetCoordinator, GetOptions};
use crate::msg::{TreeAnswer, TreeQuery, VnodeHandle, VnodeMsg};
use dotkv_ring::RingSnapshot;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Interval between exchange ticks.
    pub sync_interval: Duration,
    /// Token bucket size per vnode.
    pub hashtree_tokens: usize,
    /// Replication factor, used to enumerate preflist peers.
    pub n: usize,
    /// Deadline for one hashtree query.
    pub op_timeout: Duration,
    /// Deadline for one key repair round.
    pub repair_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_millis(2000),
            hashtree_tokens: 90,
            n: 3,
            op_timeout: Duration::from_millis(5000),
            repair_timeout: Duration::from_millis(10_000),
        }
    }
}

/// What one exchange round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub diverged: bool,
    pub keys_examined: usize,
}

pub struct ExchangeManager {
    ring: Arc<RwLock<Arc<RingSnapshot>>>,
    vnodes: Arc<HashMap<u32, VnodeHandle>>,
    tokens: HashMap<u32, Arc<Semaphore>>,
    busy: Arc<Mutex<HashSet<(u32, u32)>>>,
    config: ExchangeConfig,
}

impl ExchangeManager {
    pub fn new(
        ring: Arc<RwLock<Arc<RingSnapshot>>>,
        vnodes: Arc<HashMap<u32, VnodeHandle>>,
        config: ExchangeConfig,
    ) -> Self {
        let tokens = vnodes
            .keys()
            .map(|&index| (index, Arc::new(Semaphore::new(config.hashtree_tokens))))
            .collect();
        Self {
            ring,
            vnodes,
            tokens,
            busy: Arc::new(Mutex::new(HashSet::new())),
            config,
        }
    }

    /// Start the periodic tick loop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.sync_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                self.tick();
            }
        })
    }

    /// One tick: pick a random vnode and a random preflist peer, start an
    /// exchange unless that pair is already busy.
    pub fn tick(&self) {
        let ring = self.ring.read().expect("ring lock poisoned").clone();
        let mut rng = rand::thread_rng();

        let local: Vec<u32> = self.vnodes.keys().copied().collect();
        let Some(&p) = local.choose(&mut rng) else {
            return;
        };
        let peers: Vec<u32> = ring
            .peers(p, self.config.n)
            .into_iter()
            .filter(|q| self.vnodes.contains_key(q))
            .collect();
        let Some(&q) = peers.choose(&mut rng) else {
            return;
        };

        let pair = (p.min(q), p.max(q));
        {
            let mut busy = self.busy.lock().expect("busy set poisoned");
            if !busy.insert(pair) {
                dotkv_metrics::metrics().exchanges_skipped.inc();
                tracing::debug!(a = pair.0, b = pair.1, "exchange pair busy, tick dropped");
                return;
            }
        }

        let a = self.vnodes[&p].clone();
        let b = self.vnodes[&q].clone();
        let tok_a = self.tokens[&p].clone();
        let tok_b = self.tokens[&q].clone();
        let busy = self.busy.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            match exchange_pair(&a, &b, &tok_a, &tok_b, &config).await {
                Ok(outcome) => {
                    dotkv_metrics::metrics().exchanges.inc();
                    if outcome.diverged {
                        tracing::info!(
                            a = a.index,
                            b = b.index,
                            keys = outcome.keys_examined,
                            "exchange repaired divergent keys"
                        );
                    }
                }
                Err(e) => {
                    dotkv_metrics::metrics().exchanges_skipped.inc();
                    tracing::debug!(a = a.index, b = b.index, error = %e, "exchange aborted");
                }
            }
            busy.lock().expect("busy set poisoned").remove(&pair);
        });
    }
}

/// Run one full exchange between two vnodes.
pub async fn exchange_pair(
    a: &VnodeHandle,
    b: &VnodeHandle,
    tok_a: &Semaphore,
    tok_b: &Semaphore,
    config: &ExchangeConfig,
) -> Result<ExchangeOutcome, ErrorKind> {
    let (root_a, root_b) = futures::future::try_join(
        query(a, tok_a, TreeQuery::Root, config.op_timeout),
        query(b, tok_b, TreeQuery::Root, config.op_timeout),
    )
    .await?;
    if hash_of(&root_a)? == hash_of(&root_b)? {
        return Ok(ExchangeOutcome::default());
    }

    let (branches_a, branches_b) = futures::future::try_join(
        query(a, tok_a, TreeQuery::Branches, config.op_timeout),
        query(b, tok_b, TreeQuery::Branches, config.op_timeout),
    )
    .await?;
    let branches_a = hashes_of(&branches_a)?;
    let branches_b = hashes_of(&branches_b)?;
    let children = branches_a.len();

    let mut candidates: BTreeSet<dotkv_common::Bkey> = BTreeSet::new();
    for branch in 0..children.min(branches_b.len()) {
        if branches_a[branch] == branches_b[branch] {
            continue;
        }
        let (leaves_a, leaves_b) = futures::future::try_join(
            query(a, tok_a, TreeQuery::Leaves { branch }, config.op_timeout),
            query(b, tok_b, TreeQuery::Leaves { branch }, config.op_timeout),
        )
        .await?;
        let leaves_a = hashes_of(&leaves_a)?;
        let leaves_b = hashes_of(&leaves_b)?;

        for i in 0..leaves_a.len().min(leaves_b.len()) {
            if leaves_a[i] == leaves_b[i] {
                continue;
            }
            let leaf = branch * children + i;
            let (keys_a, keys_b) = futures::future::try_join(
                query(a, tok_a, TreeQuery::LeafKeys { leaf }, config.op_timeout),
                query(b, tok_b, TreeQuery::LeafKeys { leaf }, config.op_timeout),
            )
            .await?;
            candidates.extend(keys_of(keys_a)?);
            candidates.extend(keys_of(keys_b)?);
        }
    }

    // Key repair: a two-vnode get in repair mode syncs the pair and
    // pushes the merged object back to whichever side is stale.
    let keys_examined = candidates.len();
    for bkey in candidates {
        let rx = GetCoordinator::spawn(
            bkey,
            vec![a.clone(), b.clone()],
            GetOptions::repair_mode(config.repair_timeout),
        );
        let _ = rx.await;
    }

    Ok(ExchangeOutcome {
        diverged: keys_examined > 0,
        keys_examined,
    })
}

/// One hashtree query against a vnode, bounded by the token bucket and
/// the per-operation deadline.
async fn query(
    handle: &VnodeHandle,
    tokens: &Semaphore,
    q: TreeQuery,
    timeout: Duration,
) -> Result<TreeAnswer, ErrorKind> {
    let _permit = tokens.try_acquire().map_err(|_| ErrorKind::Overload)?;
    let (tx, rx) = oneshot::channel();
    handle.deliver(VnodeMsg::Tree { query: q, reply: tx })?;
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => Err(ErrorKind::Timeout),
        Ok(Err(_)) => Err(ErrorKind::NotReady),
        Ok(Ok(answer)) => answer,
    }
}

fn hash_of(answer: &TreeAnswer) -> Result<crate::hashtree::TreeHash, ErrorKind> {
    match answer {
        TreeAnswer::Hash(h) => Ok(*h),
        _ => Err(ErrorKind::NotReady),
    }
}

fn hashes_of(answer: &TreeAnswer) -> Result<Vec<crate::hashtree::TreeHash>, ErrorKind> {
    match answer {
        TreeAnswer::Hashes(hs) => Ok(hs.clone()),
        _ => Err(ErrorKind::NotReady),
    }
}

fn keys_of(answer: TreeAnswer) -> Result<Vec<dotkv_common::Bkey>, ErrorKind> {
    match answer {
        TreeAnswer::Keys(keys) => Ok(keys),
        _ => Err(ErrorKind::NotReady),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
