//! Periodic log reporter.
//!
//! Two background intervals: a short one that logs a one-line operation
//! summary from the global counters, and a longer one that flushes
//! aggregated per-vnode stats.

use dotkv_core::cluster::Cluster;
use dotkv_core::msg::{VnodeMsg, VnodeStats};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

pub fn spawn_reporter(
    cluster: Arc<Cluster>,
    report_interval: Duration,
    stats_flush_interval: Duration,
    node_kill_rate: f64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut report_tick = tokio::time::interval(report_interval);
        let mut flush_tick = tokio::time::interval(stats_flush_interval);
        // The first tick of an interval fires immediately; skip it so the
        // log doesn't open with an all-zero line.
        report_tick.tick().await;
        flush_tick.tick().await;

        loop {
            tokio::select! {
                _ = report_tick.tick() => {
                    report_counters();
                    maybe_kill_vnode(&cluster, node_kill_rate);
                }
                _ = flush_tick.tick() => flush_vnode_stats(&cluster).await,
            }
        }
    })
}

/// Fault injection: with the configured probability per tick, stop one
/// random vnode. Restart is the supervisor's job, not ours. Inert in
/// production, where the rate is 0.
fn maybe_kill_vnode(cluster: &Cluster, kill_rate: f64) {
    if kill_rate <= 0.0 || !rand::thread_rng().gen_bool(kill_rate.min(1.0)) {
        return;
    }
    let count = cluster.ring().partition_count();
    let index = rand::thread_rng().gen_range(0..count);
    if let Some(handle) = cluster.vnode(index) {
        tracing::warn!(partition = index, "chaos: killing vnode");
        let _ = handle.deliver(VnodeMsg::Shutdown);
    }
}

fn report_counters() {
    let m = dotkv_metrics::metrics();
    tracing::info!(
        gets = m.kv_gets.get(),
        puts = m.kv_puts.get(),
        deletes = m.kv_deletes.get(),
        timeouts = m.kv_timeouts.get(),
        read_repairs = m.read_repairs.get(),
        keys_repaired = m.keys_repaired.get(),
        exchanges = m.exchanges.get(),
        "ops"
    );
}

async fn flush_vnode_stats(cluster: &Cluster) {
    let mut total = VnodeStats::default();
    let mut vnodes = 0u32;
    for index in 0..cluster.ring().partition_count() {
        let Some(handle) = cluster.vnode(index) else {
            continue;
        };
        if let Some(stats) = handle.stats().await {
            total.reads += stats.reads;
            total.writes += stats.writes;
            total.repairs += stats.repairs;
            total.tree_queries += stats.tree_queries;
            vnodes += 1;
        }
    }
    tracing::info!(
        vnodes,
        reads = total.reads,
        writes = total.writes,
        repairs = total.repairs,
        tree_queries = total.tree_queries,
        "vnode stats flush"
    );
}
