//! dotkv-node: entry point for a dotkv node.
//!
//! Loads config, bootstraps a vnode per ring partition, starts the
//! anti-entropy loop and the periodic reporter, then serves until
//! interrupted.

mod report;

use dotkv_core::cluster::Cluster;
use dotkv_core::exchange::ExchangeConfig;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotkv_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config =
        dotkv_config::load_from_file(std::path::Path::new(&config_path)).unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            dotkv_config::NodeConfig::default()
        });

    let namespace_prefix = config
        .storage
        .data_dir
        .to_string_lossy()
        .into_owned();

    let cluster = Arc::new(Cluster::bootstrap(&config, &namespace_prefix)?);

    // Anti-entropy loop over the hosted vnodes.
    let entropy = ExchangeConfig {
        sync_interval: Duration::from_millis(config.entropy.sync_interval_ms),
        hashtree_tokens: config.entropy.hashtree_tokens,
        n: config.replication.n,
        ..ExchangeConfig::default()
    };
    cluster.spawn_entropy(entropy);

    // Periodic log reporter and stats flush.
    report::spawn_reporter(
        cluster.clone(),
        Duration::from_millis(config.reporting.report_interval_ms),
        Duration::from_millis(config.reporting.stats_flush_interval_ms),
        config.chaos.node_kill_rate,
    );

    // Prometheus scrape endpoint, if configured.
    if let Some(port) = config.metrics_port {
        let addr = format!("127.0.0.1:{}", port).parse()?;
        tokio::spawn(async move {
            if let Err(e) = dotkv_metrics::serve_metrics(addr).await {
                tracing::error!("metrics server failed: {}", e);
            }
        });
    }

    tracing::info!(node = %config.node_name, "dotkv node running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    cluster.shutdown();
    Ok(())
}
