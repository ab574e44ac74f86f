//! Raft-replicated coordination service.
//!
//! A small cluster of nodes agrees on a single ordered log and applies it to
//! a durable key-value store. On top of plain `Put`/`Get`/`Delete`/`Scan`
//! the service offers exclusive locks bound to client sessions (released
//! automatically when a client stops sending keepalives) and long-poll
//! watches on keys.
//!
//! # Architecture
//!
//! - Each node runs on tokio: an RPC server accepts framed requests, and a
//!   handful of background tasks drive elections, replication, application of
//!   committed entries and session expiry.
//! - Every mutation (including lock grants and session releases) goes through
//!   the replicated log, so all replicas make the same decisions.
//! - Reads are served by the leader after it confirms its term with a
//!   majority, or by any member when the client accepts stale data.
//! - Watches live only in the memory of the node that serves them.
//!
//! # Modules
//!
//! - [`command`]: log entry layout and opcodes
//! - [`binlog`]: durable, index-addressed log
//! - [`meta`]: durable term and vote
//! - [`storage`]: applied state, namespaced tables, paging iterator
//! - [`session`]: session liveness and held locks
//! - [`watch`]: in-memory watch registry
//! - [`stats`]: per-operation throughput window
//! - [`node`]: consensus, client operations and the state machine
//! - [`rpc`], [`transport`], [`server`]: wire messages and how they move
//! - [`sdk`]: client library with leader discovery and retries
//! - [`config`], [`cli`], [`protocol`], [`error`]: configuration and surfaces

pub mod binlog;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod meta;
pub mod node;
pub mod protocol;
pub mod rpc;
pub mod sdk;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod watch;

/// Installs the `fmt` subscriber, honoring `RUST_LOG` (default `info`).
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
