//! Runs one member of the coordination cluster.
//!
//! Start a 3-node cluster on one machine:
//! ```bash
//! cargo run --bin coord-node -- --server-id 127.0.0.1:8001 \
//!   --members 127.0.0.1:8001,127.0.0.1:8002,127.0.0.1:8003 \
//!   --data-dir n1/data --binlog-dir n1/binlog
//! ```
//! and the same for 8002 and 8003 with their own directories.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use raft_coordinator::cli::NodeCli;
use raft_coordinator::init_tracing;
use raft_coordinator::node::RaftNode;
use raft_coordinator::server::RpcServer;
use raft_coordinator::transport::TcpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = NodeCli::parse().into_config()?;
    let listener = TcpListener::bind(&config.server_id)
        .await
        .with_context(|| format!("failed to bind {}", config.server_id))?;

    let transport = Arc::new(TcpTransport::new(config.rpc_timeout));
    let node = RaftNode::start(config, transport)?;
    let server = RpcServer::new(listener, Arc::new(node.clone()));
    info!("node listening on {}", server.local_addr()?);

    let result = server
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {err:?}");
            }
        })
        .await;
    node.shutdown();
    result
}
