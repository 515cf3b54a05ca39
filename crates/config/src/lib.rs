//! Configuration schema and loader for dotkv nodes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name this node reports to the membership layer.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Ring settings.
    #[serde(default)]
    pub ring: RingConfig,

    /// Replication / quorum settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Anti-entropy settings.
    #[serde(default)]
    pub entropy: EntropyConfig,

    /// Reporting settings.
    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Fault-injection settings (test harness only).
    #[serde(default)]
    pub chaos: ChaosConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Partition exponent P: the ring has 2^P partitions.
    #[serde(default = "default_partition_exponent")]
    pub partition_exponent: u8,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            partition_exponent: default_partition_exponent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replication factor (N).
    #[serde(default = "default_n")]
    pub n: usize,

    /// Default read quorum (R).
    #[serde(default = "default_r")]
    pub r: usize,

    /// Default write quorum (W).
    #[serde(default = "default_w")]
    pub w: usize,

    /// Get coordinator timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub get_timeout_ms: u64,

    /// Put coordinator timeout in milliseconds.
    #[serde(default = "default_put_timeout_ms")]
    pub put_timeout_ms: u64,

    /// Whether the get coordinator dispatches read-repair.
    #[serde(default = "default_true")]
    pub read_repair: bool,

    /// Share of writes fanned out to every replica rather than just the
    /// first W preflist entries.
    #[serde(default = "default_all_replicas_write_ratio")]
    pub all_replicas_write_ratio: f64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            n: default_n(),
            r: default_r(),
            w: default_w(),
            get_timeout_ms: default_timeout_ms(),
            put_timeout_ms: default_put_timeout_ms(),
            read_repair: true,
            all_replicas_write_ratio: default_all_replicas_write_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntropyConfig {
    /// Interval between exchange ticks in milliseconds.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Token bucket size capping outstanding hashtree operations per vnode.
    #[serde(default = "default_hashtree_tokens")]
    pub hashtree_tokens: usize,

    /// Merkle tree branching factor B (the tree has B^2 leaf buckets).
    #[serde(default = "default_tree_children")]
    pub tree_children: usize,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: default_sync_interval_ms(),
            hashtree_tokens: default_hashtree_tokens(),
            tree_children: default_tree_children(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Interval between reporter log lines in milliseconds.
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,

    /// Interval between stats snapshots in milliseconds.
    #[serde(default = "default_stats_flush_interval_ms")]
    pub stats_flush_interval_ms: u64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: default_report_interval_ms(),
            stats_flush_interval_ms: default_stats_flush_interval_ms(),
        }
    }
}

/// Fault injection. Both ratios MUST stay 0 outside the test harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Probability that a replica drops an inbound put.
    #[serde(default)]
    pub replication_fail_ratio: f64,

    /// Probability per report tick of killing a random vnode.
    #[serde(default)]
    pub node_kill_rate: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            replication_fail_ratio: 0.0,
            node_kill_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for per-vnode namespaces.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

// --- Defaults ---

fn default_node_name() -> String {
    "node1".to_string()
}
fn default_partition_exponent() -> u8 {
    6
}
fn default_n() -> usize {
    3
}
fn default_r() -> usize {
    2
}
fn default_w() -> usize {
    2
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_put_timeout_ms() -> u64 {
    20_000
}
fn default_true() -> bool {
    true
}
fn default_all_replicas_write_ratio() -> f64 {
    0.9
}
fn default_sync_interval_ms() -> u64 {
    2000
}
fn default_hashtree_tokens() -> usize {
    90
}
fn default_tree_children() -> usize {
    10
}
fn default_report_interval_ms() -> u64 {
    2500
}
fn default_stats_flush_interval_ms() -> u64 {
    10_000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = self.ring.partition_exponent;
        if p == 0 || p > 16 {
            return Err(ConfigError::Invalid(
                "ring.partition_exponent must be in 1..=16".into(),
            ));
        }
        if self.replication.n == 0 {
            return Err(ConfigError::Invalid("replication.n must be > 0".into()));
        }
        if self.replication.n > (1usize << p) {
            return Err(ConfigError::Invalid(format!(
                "replication.n ({}) must be <= partition count ({})",
                self.replication.n,
                1usize << p
            )));
        }
        if self.replication.r == 0 || self.replication.r > self.replication.n {
            return Err(ConfigError::Invalid(format!(
                "replication.r ({}) must be in 1..=n ({})",
                self.replication.r, self.replication.n
            )));
        }
        if self.replication.w == 0 || self.replication.w > self.replication.n {
            return Err(ConfigError::Invalid(format!(
                "replication.w ({}) must be in 1..=n ({})",
                self.replication.w, self.replication.n
            )));
        }
        for (name, ratio) in [
            (
                "replication.all_replicas_write_ratio",
                self.replication.all_replicas_write_ratio,
            ),
            (
                "chaos.replication_fail_ratio",
                self.chaos.replication_fail_ratio,
            ),
            ("chaos.node_kill_rate", self.chaos.node_kill_rate),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::Invalid(format!(
                    "{} ({}) must be in [0.0, 1.0]",
                    name, ratio
                )));
            }
        }
        if self.entropy.tree_children < 2 {
            return Err(ConfigError::Invalid(
                "entropy.tree_children must be >= 2".into(),
            ));
        }
        if self.entropy.hashtree_tokens == 0 {
            return Err(ConfigError::Invalid(
                "entropy.hashtree_tokens must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        load_from_str("{}").expect("empty config must parse to defaults")
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
