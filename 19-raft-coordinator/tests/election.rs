//! Leader election over the in-memory network.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use common::TestCluster;
use raft_coordinator::rpc::Role;
use tokio::time::{Instant, sleep};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_elects_itself() -> Result<()> {
    let cluster = TestCluster::start(1)?;
    let leader = cluster.wait_for_leader(Duration::from_secs(2)).await?;
    assert_eq!(leader, "n1");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_leader_per_term() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.wait_for_leader(Duration::from_secs(3)).await?;

    let mut leaders_by_term: HashMap<i64, String> = HashMap::new();
    let until = Instant::now() + Duration::from_secs(1);
    while Instant::now() < until {
        for node in &cluster.nodes {
            let status = node.status();
            if status.role != Role::Leader {
                continue;
            }
            let seen = leaders_by_term
                .entry(status.term)
                .or_insert_with(|| status.server_id.clone());
            assert_eq!(*seen, status.server_id, "two leaders in term {}", status.term);
        }
        sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_leader_after_isolation() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    let old = cluster.wait_for_leader(Duration::from_secs(3)).await?;
    let old_term = cluster.node(&old).status().term;

    cluster.network.isolate(&old);
    let rest: Vec<String> = cluster.ids.iter().filter(|id| **id != old).cloned().collect();
    let new = cluster
        .wait_for_leader_among(&rest, Duration::from_secs(5))
        .await?;
    assert_ne!(new, old);
    assert!(cluster.node(&new).status().term > old_term);

    // Once healed, the old leader hears the newer term and steps down.
    cluster.network.heal_all();
    let old_node = cluster.node(&old);
    let expected = Some(new);
    common::eventually(Duration::from_secs(5), || {
        let expected = expected.clone();
        async move { !old_node.is_leader() && old_node.leader_id() == expected }
    })
    .await?;
    Ok(())
}
