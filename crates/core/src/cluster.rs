//! The programmatic client handle.
//!
//! A [`Cluster`] owns the ring snapshot and the mailboxes of the vnodes
//! hosted in this process. Client calls compute the preflist, spawn a
//! coordinator FSM over the replica mailboxes and await its reply. The
//! context travels to and from clients as an opaque token; a token that
//! fails validation is rejected before anything is dispatched.

use crate::codec::{decode_context, encode_context};
use crate::dvv::{Value, VersionVector};
use crate::error::ErrorKind;
use crate::exchange::{ExchangeConfig, ExchangeManager};
use crate::get_fsm::{GetCoordinator, GetOptions, GetReply};
use crate::msg::{VnodeHandle, VnodeMsg};
use crate::put_fsm::{PutCoordinator, PutOptions, PutReply};
use crate::vnode::{Vnode, VnodeConfig};
use dotkv_common::Bkey;
use dotkv_config::NodeConfig;
use dotkv_ring::RingSnapshot;
use dotkv_storage::StorageError;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Quorum and replication configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Replication factor (N).
    pub n: usize,
    /// Default read quorum (R).
    pub r: usize,
    /// Default write quorum (W).
    pub w: usize,
    pub get_timeout: Duration,
    pub put_timeout: Duration,
    pub read_repair: bool,
    /// Share of writes dispatched to every replica instead of the first
    /// W preflist entries.
    pub all_replicas_write_ratio: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            n: 3,
            r: 2,
            w: 2,
            get_timeout: Duration::from_millis(10_000),
            put_timeout: Duration::from_millis(20_000),
            read_repair: true,
            all_replicas_write_ratio: 0.9,
        }
    }
}

impl From<&NodeConfig> for ClusterConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            n: config.replication.n,
            r: config.replication.r,
            w: config.replication.w,
            get_timeout: Duration::from_millis(config.replication.get_timeout_ms),
            put_timeout: Duration::from_millis(config.replication.put_timeout_ms),
            read_repair: config.replication.read_repair,
            all_replicas_write_ratio: config.replication.all_replicas_write_ratio,
        }
    }
}

/// Per-request get overrides; `None` falls back to the cluster defaults.
#[derive(Debug, Clone, Default)]
pub struct GetOpts {
    pub read_acks: Option<usize>,
    pub timeout: Option<Duration>,
    pub do_read_repair: Option<bool>,
}

/// Per-request put/delete overrides.
#[derive(Debug, Clone, Default)]
pub struct PutOpts {
    pub put_acks: Option<usize>,
    pub timeout: Option<Duration>,
    /// Fire-and-forget: return immediately, never await the quorum.
    pub no_reply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResult {
    Found {
        /// All surviving siblings; more than one means a concurrent
        /// conflict the client must resolve.
        values: Vec<Vec<u8>>,
        /// Token to echo on the next write.
        context: Vec<u8>,
    },
    NotFound {
        context: Vec<u8>,
    },
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutResult {
    Ok,
    Error(ErrorKind),
    Timeout,
}

pub struct Cluster {
    ring: Arc<RwLock<Arc<RingSnapshot>>>,
    vnodes: Arc<HashMap<u32, VnodeHandle>>,
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("vnodes", &self.vnodes.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Assemble a cluster from already-spawned vnodes.
    pub fn new(
        ring: RingSnapshot,
        vnodes: HashMap<u32, VnodeHandle>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            ring: Arc::new(RwLock::new(Arc::new(ring))),
            vnodes: Arc::new(vnodes),
            config,
        }
    }

    /// Spawn a vnode for every ring partition and assemble the cluster.
    /// Storage namespaces are `<prefix>/vnode-<index>`.
    pub fn bootstrap(config: &NodeConfig, namespace_prefix: &str) -> Result<Self, StorageError> {
        let ring = RingSnapshot::uniform(
            config.ring.partition_exponent,
            &[config.node_name.clone()],
        )
        .expect("validated config produces a valid ring");

        let vnode_config = VnodeConfig {
            tree_children: config.entropy.tree_children,
            fail_ratio: config.chaos.replication_fail_ratio,
            ..VnodeConfig::default()
        };

        let mut vnodes = HashMap::new();
        for index in 0..ring.partition_count() {
            let namespace = format!("{}/vnode-{}", namespace_prefix, index);
            let handle = Vnode::spawn(index, &namespace, vnode_config.clone())?;
            vnodes.insert(index, handle);
        }

        tracing::info!(
            partitions = ring.partition_count(),
            node = %config.node_name,
            "cluster bootstrapped"
        );
        Ok(Self::new(ring, vnodes, ClusterConfig::from(config)))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn ring(&self) -> Arc<RingSnapshot> {
        self.ring.read().expect("ring lock poisoned").clone()
    }

    /// Install a new ownership snapshot. In-flight coordinators keep the
    /// snapshot they started with.
    pub fn install_ring(&self, snapshot: RingSnapshot) {
        *self.ring.write().expect("ring lock poisoned") = Arc::new(snapshot);
    }

    /// Mailbox of a hosted vnode, for inspection and fault injection.
    pub fn vnode(&self, index: u32) -> Option<&VnodeHandle> {
        self.vnodes.get(&index)
    }

    /// Partition indices of a key's preflist under the current ring.
    pub fn preflist(&self, bkey: &Bkey) -> Vec<u32> {
        self.ring()
            .replicas(bkey, self.config.n)
            .into_iter()
            .map(|(index, _)| index)
            .collect()
    }

    /// Start the anti-entropy loop for the hosted vnodes.
    pub fn spawn_entropy(&self, config: ExchangeConfig) -> tokio::task::JoinHandle<()> {
        ExchangeManager::new(self.ring.clone(), self.vnodes.clone(), config).spawn()
    }

    // -----------------------------------------------------------------------
    // Client API
    // -----------------------------------------------------------------------

    pub async fn get(&self, bkey: &Bkey, opts: GetOpts) -> GetResult {
        dotkv_metrics::metrics().kv_gets.inc();
        let _timer = dotkv_metrics::start_kv_timer("get");

        let replicas = self.replica_handles(bkey);
        let options = GetOptions {
            r: opts.read_acks.unwrap_or(self.config.r),
            timeout: opts.timeout.unwrap_or(self.config.get_timeout),
            do_read_repair: opts.do_read_repair.unwrap_or(self.config.read_repair),
            return_value: true,
        };

        let rx = GetCoordinator::spawn(bkey.clone(), replicas, options);
        match rx.await {
            Ok(GetReply::Ok { values, context }) => GetResult::Found {
                values,
                context: encode_context(&context),
            },
            Ok(GetReply::NotFound { context }) => GetResult::NotFound {
                context: encode_context(&context),
            },
            Ok(GetReply::Done) | Err(_) | Ok(GetReply::Timeout) => {
                dotkv_metrics::metrics().kv_timeouts.inc();
                GetResult::Timeout
            }
        }
    }

    pub async fn put(
        &self,
        bkey: &Bkey,
        context: Option<&[u8]>,
        value: Vec<u8>,
        opts: PutOpts,
    ) -> PutResult {
        dotkv_metrics::metrics().kv_puts.inc();
        let _timer = dotkv_metrics::start_kv_timer("put");
        self.write(bkey, context, Value::Data(value), opts).await
    }

    pub async fn delete(&self, bkey: &Bkey, context: Option<&[u8]>, opts: PutOpts) -> PutResult {
        dotkv_metrics::metrics().kv_deletes.inc();
        let _timer = dotkv_metrics::start_kv_timer("delete");
        self.write(bkey, context, Value::Tombstone, opts).await
    }

    async fn write(
        &self,
        bkey: &Bkey,
        context: Option<&[u8]>,
        value: Value,
        opts: PutOpts,
    ) -> PutResult {
        let ctx = match context {
            None => VersionVector::new(),
            Some(token) => match decode_context(token) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::debug!(key = %bkey, %e, "rejected malformed context");
                    return PutResult::Error(ErrorKind::InvalidContext);
                }
            },
        };

        let w = opts.put_acks.unwrap_or(self.config.w);
        let mut replicas = self.replica_handles(bkey);
        // Most writes go to every replica; the remainder stop at the
        // quorum and leave the tail to read-repair and anti-entropy.
        let all = rand::thread_rng().gen_bool(self.config.all_replicas_write_ratio.clamp(0.0, 1.0));
        if !all {
            replicas.truncate(w.max(1));
        }

        let options = PutOptions {
            w,
            timeout: opts.timeout.unwrap_or(self.config.put_timeout),
        };

        if opts.no_reply {
            PutCoordinator::spawn_no_reply(bkey.clone(), ctx, value, replicas, options);
            return PutResult::Ok;
        }

        let rx = PutCoordinator::spawn(bkey.clone(), ctx, value, replicas, options);
        match rx.await {
            Ok(PutReply::Ok) => PutResult::Ok,
            Ok(PutReply::Error(e)) => PutResult::Error(e),
            Ok(PutReply::Timeout) | Err(_) => {
                dotkv_metrics::metrics().kv_timeouts.inc();
                PutResult::Timeout
            }
        }
    }

    /// Mailboxes of the key's preflist, skipping partitions this process
    /// does not host.
    fn replica_handles(&self, bkey: &Bkey) -> Vec<VnodeHandle> {
        self.ring()
            .replicas(bkey, self.config.n)
            .into_iter()
            .filter_map(|(index, _)| self.vnodes.get(&index).cloned())
            .collect()
    }

    /// Ask every hosted vnode to stop. Used by tests and shutdown paths.
    pub fn shutdown(&self) {
        for handle in self.vnodes.values() {
            let _ = handle.deliver(VnodeMsg::Shutdown);
        }
    }
}
