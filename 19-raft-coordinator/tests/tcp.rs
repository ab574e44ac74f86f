//! End-to-end over real sockets: three nodes behind `RpcServer`s and a client
//! using `TcpTransport`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use raft_coordinator::config::ClientConfig;
use raft_coordinator::node::RaftNode;
use raft_coordinator::sdk::Client;
use raft_coordinator::server::RpcServer;
use raft_coordinator::transport::TcpTransport;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_over_tcp() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut listeners = Vec::new();
    for _ in 0..3 {
        listeners.push(TcpListener::bind("127.0.0.1:0").await?);
    }
    let members: Vec<String> = listeners
        .iter()
        .map(|listener| listener.local_addr().map(|addr| addr.to_string()))
        .collect::<std::io::Result<_>>()?;

    let shutdown = CancellationToken::new();
    let mut nodes = Vec::new();
    let mut servers = Vec::new();
    for (listener, id) in listeners.into_iter().zip(&members) {
        let config = common::fast_config(id, &members).with_root_dir(dir.path());
        let node = RaftNode::start(config, Arc::new(TcpTransport::new(common::RPC_TIMEOUT)))?;
        let server = RpcServer::new(listener, Arc::new(node.clone()));
        let stop = shutdown.clone();
        servers.push(tokio::spawn(async move {
            server.run_until(async move { stop.cancelled().await }).await
        }));
        nodes.push(node);
    }

    let client = Client::connect(ClientConfig {
        rpc_timeout: common::RPC_TIMEOUT,
        retry_sleep: Duration::from_millis(100),
        max_sync_rounds: 30,
        ..ClientConfig::new(members.clone())
    });
    client.put("over", "tcp").await?;
    assert_eq!(client.get("over").await?, "tcp");
    client.try_lock("tcp-lock").await?;
    assert_eq!(client.show_cluster().await.len(), 3);
    assert_eq!(nodes.iter().filter(|node| node.is_leader()).count(), 1);

    drop(client);
    shutdown.cancel();
    for server in servers {
        server.await??;
    }
    for node in &nodes {
        node.shutdown();
    }
    Ok(())
}
