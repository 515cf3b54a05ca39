//! Multi-vnode convergence tests.
//!
//! These exercise the full coordinator stack over an in-process cluster:
//! quorum reads and writes under partitions, sibling creation and
//! resolution, tombstones, read repair and anti-entropy.

use dotkv_common::Bkey;
use dotkv_core::cluster::{Cluster, ClusterConfig, GetOpts, GetResult, PutOpts, PutResult};
use dotkv_core::codec::decode_context;
use dotkv_core::dvv::Dvv;
use dotkv_core::error::ErrorKind;
use dotkv_core::exchange::{exchange_pair, ExchangeConfig};
use dotkv_core::msg::{ReplicaReply, VnodeHandle, VnodeMsg};
use dotkv_core::vnode::{Vnode, VnodeConfig};
use dotkv_ring::RingSnapshot;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

// ────────────────────────── TestCluster ──────────────────────────

struct TestCluster {
    cluster: Cluster,
}

impl TestCluster {
    /// 16-partition single-process cluster, N=3 R=2 W=2, every write
    /// fanned to all replicas so tests are deterministic.
    fn new(tag: &str) -> Self {
        Self::with_exponent(tag, 4)
    }

    fn with_exponent(tag: &str, exponent: u8) -> Self {
        let ring = RingSnapshot::uniform(exponent, &["n1".to_string()]).unwrap();
        let vnode_config = VnodeConfig {
            open_backoff: Duration::from_millis(5),
            ..VnodeConfig::default()
        };

        let mut vnodes = HashMap::new();
        for index in 0..ring.partition_count() {
            let namespace = format!("it/{}/vnode-{}", tag, index);
            let handle = Vnode::spawn(index, &namespace, vnode_config.clone()).unwrap();
            vnodes.insert(index, handle);
        }

        let config = ClusterConfig {
            all_replicas_write_ratio: 1.0,
            ..ClusterConfig::default()
        };
        Self {
            cluster: Cluster::new(ring, vnodes, config),
        }
    }

    fn partition(&self, index: u32, on: bool) {
        self.cluster
            .vnode(index)
            .unwrap()
            .deliver(VnodeMsg::SetPartitioned(on))
            .unwrap();
    }

    /// Read a key's object straight off one vnode, bypassing quorum.
    async fn vnode_object(&self, index: u32, bkey: &Bkey) -> Option<Dvv> {
        vnode_object(self.cluster.vnode(index).unwrap(), bkey).await
    }
}

async fn vnode_object(handle: &VnodeHandle, bkey: &Bkey) -> Option<Dvv> {
    let (tx, mut rx) = mpsc::channel(1);
    handle
        .deliver(VnodeMsg::Read {
            reqid: Uuid::new_v4(),
            bkey: bkey.clone(),
            reply: tx,
        })
        .unwrap();
    match rx.recv().await.unwrap() {
        ReplicaReply::ReadOk { object, .. } => Some(*object),
        ReplicaReply::Error {
            error: ErrorKind::NotFound,
            ..
        } => None,
        other => panic!("unexpected reply: {:?}", other),
    }
}

fn bkey(bucket: &str, key: &str) -> Bkey {
    Bkey::new(bucket.as_bytes().to_vec(), key.as_bytes().to_vec())
}

fn found(result: GetResult) -> (Vec<Vec<u8>>, Vec<u8>) {
    match result {
        GetResult::Found { values, context } => (values, context),
        other => panic!("expected Found, got {:?}", other),
    }
}

// ────────────────────────── Quorum basics ──────────────────────────

#[tokio::test]
async fn test_put_succeeds_with_one_replica_down() {
    // Scenario: W=2 put on a 3-replica preflist with replica #3 stopped.
    let tc = TestCluster::new("one_replica_down");
    let k = bkey("b", "k1");

    let preflist = tc.cluster.preflist(&k);
    assert_eq!(preflist.len(), 3);
    tc.partition(preflist[2], true);

    let put = tc
        .cluster
        .put(&k, None, b"v1".to_vec(), PutOpts::default())
        .await;
    assert_eq!(put, PutResult::Ok);

    let (values, context) = found(tc.cluster.get(&k, GetOpts::default()).await);
    assert_eq!(values, vec![b"v1".to_vec()]);
    assert!(!decode_context(&context).unwrap().is_empty());
}

#[tokio::test]
async fn test_read_your_write_quorum_overlap() {
    // R + W > N: a successful put followed by a quiet get sees the value.
    let tc = TestCluster::new("rw_overlap");
    for i in 0..10 {
        let k = bkey("b", &format!("k{}", i));
        let value = format!("v{}", i).into_bytes();
        assert_eq!(
            tc.cluster.put(&k, None, value.clone(), PutOpts::default()).await,
            PutResult::Ok
        );
        let (values, _) = found(tc.cluster.get(&k, GetOpts::default()).await);
        assert_eq!(values, vec![value]);
    }
}

#[tokio::test]
async fn test_causal_overwrite_with_context() {
    let tc = TestCluster::new("causal_overwrite");
    let k = bkey("b", "k");

    tc.cluster
        .put(&k, None, b"v1".to_vec(), PutOpts::default())
        .await;
    let (_, ctx1) = found(tc.cluster.get(&k, GetOpts::default()).await);

    tc.cluster
        .put(&k, Some(&ctx1), b"v2".to_vec(), PutOpts::default())
        .await;
    let (values, _) = found(tc.cluster.get(&k, GetOpts::default()).await);
    assert_eq!(values, vec![b"v2".to_vec()]);
}

#[tokio::test]
async fn test_no_reply_put_is_fire_and_forget() {
    let tc = TestCluster::new("no_reply");
    let k = bkey("b", "k");

    let result = tc
        .cluster
        .put(
            &k,
            None,
            b"v".to_vec(),
            PutOpts {
                no_reply: true,
                ..PutOpts::default()
            },
        )
        .await;
    assert_eq!(result, PutResult::Ok);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (values, _) = found(tc.cluster.get(&k, GetOpts::default()).await);
    assert_eq!(values, vec![b"v".to_vec()]);
}

#[tokio::test]
async fn test_malformed_context_rejected() {
    let tc = TestCluster::new("bad_context");
    let k = bkey("b", "k");

    let result = tc
        .cluster
        .put(&k, Some(b"not a token"), b"v".to_vec(), PutOpts::default())
        .await;
    assert_eq!(result, PutResult::Error(ErrorKind::InvalidContext));

    // Nothing was dispatched.
    let preflist = tc.cluster.preflist(&k);
    assert!(tc.vnode_object(preflist[0], &k).await.is_none());
}

// ────────────────────────── Siblings ──────────────────────────

#[tokio::test]
async fn test_concurrent_puts_create_siblings() {
    // Scenario B: two blind writes to the same key.
    let tc = TestCluster::new("siblings");
    let k = bkey("b", "k2");

    tc.cluster
        .put(&k, None, b"A".to_vec(), PutOpts::default())
        .await;
    tc.cluster
        .put(&k, None, b"B".to_vec(), PutOpts::default())
        .await;

    let (values, _) = found(tc.cluster.get(&k, GetOpts::default()).await);
    assert_eq!(values, vec![b"A".to_vec(), b"B".to_vec()]);
}

#[tokio::test]
async fn test_partial_context_resolves_only_observed_sibling() {
    // Scenario C: a write whose context observed only B dominates B but
    // stays concurrent with A.
    let tc = TestCluster::new("partial_resolve");
    let k = bkey("b", "k2");

    tc.cluster
        .put(&k, None, b"B".to_vec(), PutOpts::default())
        .await;
    let (_, ctx_b) = found(tc.cluster.get(&k, GetOpts::default()).await);

    // Concurrent with B as far as causality knows.
    tc.cluster
        .put(&k, None, b"A".to_vec(), PutOpts::default())
        .await;

    tc.cluster
        .put(
            &k,
            Some(&ctx_b),
            b"C".to_vec(),
            PutOpts {
                put_acks: Some(3),
                ..PutOpts::default()
            },
        )
        .await;

    let (values, ctx_all) = found(tc.cluster.get(&k, GetOpts::default()).await);
    assert_eq!(values, vec![b"A".to_vec(), b"C".to_vec()]);

    // A context that observed everything resolves the conflict entirely.
    tc.cluster
        .put(&k, Some(&ctx_all), b"D".to_vec(), PutOpts::default())
        .await;
    let (values, _) = found(tc.cluster.get(&k, GetOpts::default()).await);
    assert_eq!(values, vec![b"D".to_vec()]);
}

// ────────────────────────── Deletes ──────────────────────────

#[tokio::test]
async fn test_delete_leaves_causal_tombstone() {
    // Scenario D: delete with a valid context, then not_found with a
    // non-empty context.
    let tc = TestCluster::new("delete");
    let k = bkey("b", "k3");

    tc.cluster
        .put(&k, None, b"v".to_vec(), PutOpts::default())
        .await;
    let (_, ctx) = found(tc.cluster.get(&k, GetOpts::default()).await);

    assert_eq!(
        tc.cluster.delete(&k, Some(&ctx), PutOpts::default()).await,
        PutResult::Ok
    );

    match tc.cluster.get(&k, GetOpts::default()).await {
        GetResult::NotFound { context } => {
            let ctx = decode_context(&context).unwrap();
            assert!(!ctx.is_empty(), "tombstone must keep the causal history");
        }
        other => panic!("expected NotFound, got {:?}", other),
    }

    // The tombstoned object is still on disk, values suppressed.
    let primary = tc.cluster.preflist(&k)[0];
    let object = tc.vnode_object(primary, &k).await.unwrap();
    assert!(object.values().is_empty());
    assert!(object.dotted_len() > 0);
}

// ────────────────────────── Timeouts ──────────────────────────

#[tokio::test]
async fn test_get_times_out_when_replicas_silent() {
    // Scenario F: every replica partitioned, short client timeout.
    let tc = TestCluster::new("get_timeout");
    let k = bkey("b", "k");

    for index in tc.cluster.preflist(&k) {
        tc.partition(index, true);
    }

    let result = tc
        .cluster
        .get(
            &k,
            GetOpts {
                timeout: Some(Duration::from_millis(100)),
                ..GetOpts::default()
            },
        )
        .await;
    assert_eq!(result, GetResult::Timeout);
}

#[tokio::test]
async fn test_put_times_out_when_replicas_silent() {
    let tc = TestCluster::new("put_timeout");
    let k = bkey("b", "k");

    for index in tc.cluster.preflist(&k) {
        tc.partition(index, true);
    }

    let result = tc
        .cluster
        .put(
            &k,
            None,
            b"v".to_vec(),
            PutOpts {
                timeout: Some(Duration::from_millis(100)),
                ..PutOpts::default()
            },
        )
        .await;
    assert_eq!(result, PutResult::Timeout);
}

// ────────────────────────── Read repair ──────────────────────────

#[tokio::test]
async fn test_read_repair_converges_replicas() {
    let tc = TestCluster::new("read_repair");
    let k = bkey("b", "k");
    let preflist = tc.cluster.preflist(&k);

    tc.cluster
        .put(&k, None, b"v1".to_vec(), PutOpts::default())
        .await;
    let (_, ctx) = found(tc.cluster.get(&k, GetOpts::default()).await);

    // Third replica misses the second write.
    tc.partition(preflist[2], true);
    tc.cluster
        .put(&k, Some(&ctx), b"v2".to_vec(), PutOpts::default())
        .await;
    tc.partition(preflist[2], false);

    let stale = tc.vnode_object(preflist[2], &k).await.unwrap();
    assert_eq!(stale.values(), vec![b"v1".as_slice()]);

    // A quorum get answers from the fresh replicas and repairs the
    // stale one in finalize.
    let (values, _) = found(tc.cluster.get(&k, GetOpts::default()).await);
    assert_eq!(values, vec![b"v2".to_vec()]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut objects = Vec::new();
    for &index in &preflist {
        objects.push(tc.vnode_object(index, &k).await.unwrap());
    }
    let merged = objects
        .iter()
        .fold(Dvv::new(), |acc, obj| acc.sync(obj));
    for (i, object) in objects.iter().enumerate() {
        assert_eq!(
            object.sync(&merged),
            merged,
            "replica {} still stale after read repair",
            preflist[i]
        );
        assert_eq!(object.values(), vec![b"v2".as_slice()]);
    }
}

#[tokio::test]
async fn test_read_repair_disabled_leaves_replica_stale() {
    let tc = TestCluster::new("no_read_repair");
    let k = bkey("b", "k");
    let preflist = tc.cluster.preflist(&k);

    tc.partition(preflist[2], true);
    tc.cluster
        .put(&k, None, b"v".to_vec(), PutOpts::default())
        .await;
    tc.partition(preflist[2], false);

    tc.cluster
        .get(
            &k,
            GetOpts {
                do_read_repair: Some(false),
                ..GetOpts::default()
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(
        tc.vnode_object(preflist[2], &k).await.is_none(),
        "repair must not run when disabled"
    );
}

// ────────────────────────── Anti-entropy ──────────────────────────

#[tokio::test]
async fn test_anti_entropy_heals_partitioned_replica() {
    // Scenario E: partition one member of a preflist, write 100 keys,
    // heal, run one exchange over the pair, inspect the vnode directly.
    let tc = TestCluster::new("aae_heal");

    // Collect 100 keys that all live on the same preflist.
    let mut keys = Vec::new();
    let mut probe = 0u32;
    let target = tc.cluster.preflist(&bkey("b", "seed"));
    while keys.len() < 100 {
        let k = bkey("b", &format!("key-{}", probe));
        probe += 1;
        if tc.cluster.preflist(&k) == target {
            keys.push(k);
        }
    }

    tc.partition(target[1], true);
    for (i, k) in keys.iter().enumerate() {
        let result = tc
            .cluster
            .put(k, None, format!("v{}", i).into_bytes(), PutOpts::default())
            .await;
        assert_eq!(result, PutResult::Ok);
    }
    tc.partition(target[1], false);

    // One exchange between the healed replica and a healthy peer.
    let healthy = tc.cluster.vnode(target[0]).unwrap().clone();
    let healed = tc.cluster.vnode(target[1]).unwrap().clone();
    let tok_a = Semaphore::new(90);
    let tok_b = Semaphore::new(90);
    let outcome = exchange_pair(&healthy, &healed, &tok_a, &tok_b, &ExchangeConfig::default())
        .await
        .unwrap();
    assert!(outcome.diverged);
    assert_eq!(outcome.keys_examined, 100);

    tokio::time::sleep(Duration::from_millis(200)).await;
    for (i, k) in keys.iter().enumerate() {
        let object = tc
            .vnode_object(target[1], k)
            .await
            .unwrap_or_else(|| panic!("key {} missing on healed replica", k));
        assert_eq!(object.values(), vec![format!("v{}", i).as_bytes()]);
    }
}

#[tokio::test]
async fn test_exchange_manager_converges_cluster() {
    // Property: a quiesced cluster converges within a few sync periods.
    let tc = TestCluster::with_exponent("aae_manager", 2);
    let k = bkey("b", "k");
    let preflist = tc.cluster.preflist(&k);

    tc.partition(preflist[1], true);
    tc.cluster
        .put(&k, None, b"healed".to_vec(), PutOpts::default())
        .await;
    tc.partition(preflist[1], false);

    let handle = tc.cluster.spawn_entropy(ExchangeConfig {
        sync_interval: Duration::from_millis(20),
        ..ExchangeConfig::default()
    });

    // 4 partitions and a 20 ms tick: a couple of seconds covers every
    // pair many times over.
    let mut converged = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(object) = tc.vnode_object(preflist[1], &k).await {
            if object.values() == vec![b"healed".as_slice()] {
                converged = true;
                break;
            }
        }
    }
    handle.abort();
    assert!(converged, "anti-entropy never delivered the missed write");
}
