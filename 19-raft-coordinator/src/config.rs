//! Node and client configuration.
//!
//! Durations are written in milliseconds when loaded from JSON, e.g.
//! `{"server_id": "127.0.0.1:8868", "election_timeout_min": 150}`.
//! Missing fields fall back to [`Default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id, which is also the address peers dial.
    pub server_id: String,
    /// Every voting member, including this node.
    pub members: Vec<String>,
    pub data_dir: PathBuf,
    pub binlog_dir: PathBuf,
    #[serde(with = "millis")]
    pub election_timeout_min: Duration,
    #[serde(with = "millis")]
    pub election_timeout_max: Duration,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    pub log_rep_batch_max: usize,
    #[serde(with = "millis")]
    pub replication_retry_timespan: Duration,
    #[serde(with = "millis")]
    pub rpc_timeout: Duration,
    #[serde(with = "millis")]
    pub session_expire_timeout: Duration,
    #[serde(with = "millis")]
    pub session_sweep_interval: Duration,
    #[serde(with = "millis")]
    pub watch_poll_interval: Duration,
    #[serde(with = "millis")]
    pub watch_hold_timeout: Duration,
    pub max_pending_writes: usize,
    pub max_unapplied_entries: i64,
    /// Upper bound on the pairs one Scan call returns, whatever the client asks.
    pub max_scan_items: usize,
    pub max_cluster_size: usize,
    #[serde(with = "millis")]
    pub performance_interval: Duration,
    pub performance_buffer_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: "127.0.0.1:8868".to_string(),
            members: vec!["127.0.0.1:8868".to_string()],
            data_dir: PathBuf::from("data"),
            binlog_dir: PathBuf::from("binlog"),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            log_rep_batch_max: 500,
            replication_retry_timespan: Duration::from_millis(2000),
            rpc_timeout: Duration::from_secs(2),
            session_expire_timeout: Duration::from_secs(6),
            session_sweep_interval: Duration::from_secs(2),
            watch_poll_interval: Duration::from_millis(200),
            watch_hold_timeout: Duration::from_secs(10),
            max_pending_writes: 10_000,
            max_unapplied_entries: 100_000,
            max_scan_items: 1_000,
            max_cluster_size: 10,
            performance_interval: Duration::from_secs(1),
            performance_buffer_size: 60,
        }
    }
}

impl NodeConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Stores every node's files under `root/<sanitized server id>/`.
    pub fn with_root_dir(mut self, root: &Path) -> Self {
        let node_dir = root.join(self.server_id.replace([':', '/'], "_"));
        self.data_dir = node_dir.join("data");
        self.binlog_dir = node_dir.join("binlog");
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.server_id.is_empty(), "server_id must not be empty");
        ensure!(
            self.members.contains(&self.server_id),
            "server_id {} is not listed in members",
            self.server_id
        );
        ensure!(
            self.members.len() <= self.max_cluster_size,
            "cluster of {} members exceeds max_cluster_size {}",
            self.members.len(),
            self.max_cluster_size
        );
        ensure!(
            self.election_timeout_min < self.election_timeout_max,
            "election_timeout_min must be below election_timeout_max"
        );
        ensure!(
            self.heartbeat_interval < self.election_timeout_min,
            "heartbeat_interval must be below election_timeout_min"
        );
        ensure!(self.log_rep_batch_max > 0, "log_rep_batch_max must be positive");
        ensure!(self.max_scan_items > 0, "max_scan_items must be positive");
        Ok(())
    }

    /// Peers this node replicates to.
    pub fn peers(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|member| **member != self.server_id)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub members: Vec<String>,
    /// Partition of the applied state this client reads and writes.
    pub namespace: String,
    #[serde(with = "millis")]
    pub rpc_timeout: Duration,
    /// Deadline for one long-poll `Watch` call; should exceed the node's hold timeout.
    #[serde(with = "millis")]
    pub watch_timeout: Duration,
    #[serde(with = "millis")]
    pub retry_sleep: Duration,
    /// Full passes over the member list before a synchronous call gives up.
    pub max_sync_rounds: usize,
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,
    pub watch_error_limit: usize,
    #[serde(with = "millis")]
    pub lock_retry_backoff: Duration,
    pub scan_page_size: usize,
    /// Serve Get/Scan from any member's applied state.
    pub stale_reads: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            members: vec!["127.0.0.1:8868".to_string()],
            namespace: String::new(),
            rpc_timeout: Duration::from_secs(2),
            watch_timeout: Duration::from_secs(15),
            retry_sleep: Duration::from_secs(1),
            max_sync_rounds: 5,
            keepalive_interval: Duration::from_secs(2),
            watch_error_limit: 5,
            lock_retry_backoff: Duration::from_secs(1),
            scan_page_size: 200,
            stale_reads: false,
        }
    }
}

impl ClientConfig {
    pub fn new(members: Vec<String>) -> Self {
        Self {
            members,
            ..Self::default()
        }
    }
}

/// Parses a comma-separated member list such as `a:1,b:2`.
pub fn parse_members(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|member| !member.is_empty())
        .map(str::to_string)
        .collect()
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
