//! Session expiry releases locks held by clients that went away.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{TestCluster, eventually};
use raft_coordinator::error::SdkError;
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keepalive_holds_lock_past_the_timeout() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.wait_for_leader(Duration::from_secs(3)).await?;
    let holder = cluster.client();
    let other = cluster.client();

    holder.try_lock("leader-election").await?;
    // Longer than the 1s session timeout; keepalives keep it alive.
    sleep(Duration::from_millis(2_000)).await;
    assert_eq!(other.try_lock("leader-election").await, Err(SdkError::LockFail));
    assert_eq!(other.get("leader-election").await?, holder.session_id());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_client_lock_is_released() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    cluster.wait_for_leader(Duration::from_secs(3)).await?;
    let holder = cluster.client();
    let other = cluster.client();

    holder.try_lock("leader-election").await?;
    assert_eq!(other.try_lock("leader-election").await, Err(SdkError::LockFail));

    // Dropping the client stops its keepalives.
    drop(holder);
    let other = &other;
    eventually(Duration::from_secs(5), || async move {
        other.try_lock("leader-election").await.is_ok()
    })
    .await?;
    assert_eq!(other.get("leader-election").await?, other.session_id());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locks_survive_leader_change() -> Result<()> {
    let cluster = TestCluster::start(3)?;
    let first = cluster.wait_for_leader(Duration::from_secs(3)).await?;
    let holder = cluster.client();
    let other = cluster.client();
    holder.try_lock("shard-7").await?;

    cluster.network.isolate(&first);
    let rest: Vec<String> = cluster.ids.iter().filter(|id| **id != first).cloned().collect();
    cluster
        .wait_for_leader_among(&rest, Duration::from_secs(5))
        .await?;

    // The new leader restarts every session clock, so the holder keeps it.
    assert_eq!(other.try_lock("shard-7").await, Err(SdkError::LockFail));
    holder.unlock("shard-7").await?;
    other.try_lock("shard-7").await?;
    Ok(())
}
