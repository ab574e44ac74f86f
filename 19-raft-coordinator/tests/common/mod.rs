//! In-process cluster harness shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use raft_coordinator::config::{ClientConfig, NodeConfig};
use raft_coordinator::node::RaftNode;
use raft_coordinator::rpc::Role;
use raft_coordinator::sdk::Client;
use raft_coordinator::transport::MemoryNetwork;
use tempfile::TempDir;
use tokio::time::{Instant, sleep};

pub const RPC_TIMEOUT: Duration = Duration::from_millis(500);

/// Timings shortened so elections, expiry and retries happen within a test.
pub fn fast_config(server_id: &str, members: &[String]) -> NodeConfig {
    NodeConfig {
        server_id: server_id.to_string(),
        members: members.to_vec(),
        rpc_timeout: RPC_TIMEOUT,
        replication_retry_timespan: Duration::from_millis(200),
        session_expire_timeout: Duration::from_secs(1),
        session_sweep_interval: Duration::from_millis(200),
        watch_poll_interval: Duration::from_millis(50),
        watch_hold_timeout: Duration::from_secs(1),
        performance_interval: Duration::from_millis(200),
        ..NodeConfig::default()
    }
}

pub struct TestCluster {
    pub network: MemoryNetwork,
    pub ids: Vec<String>,
    pub nodes: Vec<RaftNode>,
    _dir: TempDir,
}

impl TestCluster {
    pub fn start(n: usize) -> Result<Self> {
        Self::start_with(n, |_| {})
    }

    /// Starts `n` nodes named `n1..=n<n>`; `tweak` adjusts each config.
    pub fn start_with(n: usize, tweak: impl Fn(&mut NodeConfig)) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let network = MemoryNetwork::new();
        let ids: Vec<String> = (1..=n).map(|i| format!("n{i}")).collect();

        let mut nodes = Vec::with_capacity(n);
        for id in &ids {
            let mut config = fast_config(id, &ids).with_root_dir(dir.path());
            tweak(&mut config);
            let transport = Arc::new(network.transport(id, RPC_TIMEOUT));
            let node = RaftNode::start(config, transport)?;
            network.register(id, Arc::new(node.clone()));
            nodes.push(node);
        }

        Ok(Self {
            network,
            ids,
            nodes,
            _dir: dir,
        })
    }

    pub fn node(&self, id: &str) -> &RaftNode {
        let index = self.ids.iter().position(|known| known == id);
        &self.nodes[index.unwrap_or_else(|| panic!("unknown node {id}"))]
    }

    /// Waits until exactly one node leads the highest term and returns its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        self.wait_for_leader_among(&self.ids, timeout).await
    }

    pub async fn wait_for_leader_among(&self, ids: &[String], timeout: Duration) -> Result<String> {
        let start = Instant::now();
        loop {
            let statuses: Vec<_> = ids.iter().map(|id| self.node(id).status()).collect();
            let top_term = statuses.iter().map(|s| s.term).max().unwrap_or(0);
            let leaders: Vec<_> = statuses
                .iter()
                .filter(|s| s.role == Role::Leader && s.term == top_term)
                .collect();
            if leaders.len() == 1 {
                return Ok(leaders[0].server_id.clone());
            }
            if start.elapsed() > timeout {
                bail!("timeout waiting for a leader among {ids:?}");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            rpc_timeout: RPC_TIMEOUT,
            watch_timeout: Duration::from_secs(3),
            retry_sleep: Duration::from_millis(100),
            max_sync_rounds: 30,
            keepalive_interval: Duration::from_millis(200),
            lock_retry_backoff: Duration::from_millis(100),
            ..ClientConfig::new(self.ids.clone())
        }
    }

    pub fn client(&self) -> Client {
        self.client_with(self.client_config())
    }

    pub fn client_with(&self, config: ClientConfig) -> Client {
        Client::with_transport(config, Arc::new(self.network.client_transport(RPC_TIMEOUT)))
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for (id, node) in self.ids.iter().zip(&self.nodes) {
            self.network.unregister(id);
            node.shutdown();
        }
    }
}

/// Polls `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("condition not reached within {timeout:?}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}
