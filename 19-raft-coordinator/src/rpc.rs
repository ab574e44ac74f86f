//! Messages exchanged between nodes and between clients and nodes.
//!
//! Every request is one variant of [`Request`] and is answered by the
//! matching variant of [`Response`]. Client-facing responses embed an
//! [`Ack`]: `success == false` with a `leader_id` is a redirect, `busy` means
//! the leader is shedding load.

use serde::{Deserialize, Serialize};

use crate::command::LogEntry;
use crate::stats::OpStatistics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Vote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    Put(PutRequest),
    Get(GetRequest),
    Delete(DeleteRequest),
    Scan(ScanRequest),
    KeepAlive(KeepAliveRequest),
    Lock(LockRequest),
    UnLock(UnLockRequest),
    Watch(WatchRequest),
    ShowStatus,
    ShowStatistics,
    CleanBinlog(CleanBinlogRequest),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Vote(_) => "Vote",
            Request::AppendEntries(_) => "AppendEntries",
            Request::Put(_) => "Put",
            Request::Get(_) => "Get",
            Request::Delete(_) => "Delete",
            Request::Scan(_) => "Scan",
            Request::KeepAlive(_) => "KeepAlive",
            Request::Lock(_) => "Lock",
            Request::UnLock(_) => "UnLock",
            Request::Watch(_) => "Watch",
            Request::ShowStatus => "ShowStatus",
            Request::ShowStatistics => "ShowStatistics",
            Request::CleanBinlog(_) => "CleanBinlog",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Vote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
    Put(Ack),
    Get(GetResponse),
    Delete(Ack),
    Scan(ScanResponse),
    KeepAlive(Ack),
    Lock(LockResponse),
    UnLock(Ack),
    Watch(WatchResponse),
    ShowStatus(ClusterNodeInfo),
    ShowStatistics(Vec<OpStatistics>),
    CleanBinlog(Ack),
}

impl Response {
    /// Routing outcome for client-facing responses; `None` for everything else.
    pub fn ack(&self) -> Option<&Ack> {
        match self {
            Response::Put(ack)
            | Response::Delete(ack)
            | Response::KeepAlive(ack)
            | Response::UnLock(ack)
            | Response::CleanBinlog(ack) => Some(ack),
            Response::Get(resp) => Some(&resp.ack),
            Response::Scan(resp) => Some(&resp.ack),
            Response::Lock(resp) => Some(&resp.ack),
            Response::Watch(resp) => Some(&resp.ack),
            Response::Vote(_)
            | Response::AppendEntries(_)
            | Response::ShowStatus(_)
            | Response::ShowStatistics(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub leader_id: Option<String>,
    pub busy: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn redirect(leader_id: Option<String>) -> Self {
        Self {
            success: false,
            leader_id,
            busy: false,
        }
    }

    pub fn busy() -> Self {
        Self {
            success: false,
            leader_id: None,
            busy: true,
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: i64,
    pub candidate_id: String,
    pub last_log_index: i64,
    pub last_log_term: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: i64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: i64,
    pub leader_id: String,
    pub prev_log_index: i64,
    pub prev_log_term: i64,
    pub entries: Vec<LogEntry>,
    pub leader_commit_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: i64,
    pub success: bool,
    /// Follower's log length, used by the leader to jump back on a mismatch.
    pub log_length: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub user: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub user: String,
    pub key: String,
    /// Allow a follower to answer from its own applied state.
    pub stale_ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub ack: Ack,
    pub hit: bool,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub user: String,
    pub key: String,
}

/// Range read over `[start_key, end_key)`; an empty `end_key` is unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub user: String,
    pub start_key: String,
    pub end_key: String,
    pub size_limit: usize,
    pub stale_ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub ack: Ack,
    pub items: Vec<(String, String)>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub user: String,
    pub key: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub ack: Ack,
    pub acquired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnLockRequest {
    pub user: String,
    pub key: String,
    pub session_id: String,
}

/// Wait until `key` differs from what the client last saw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRequest {
    pub user: String,
    pub key: String,
    pub old_value: String,
    pub key_exists: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResponse {
    pub ack: Ack,
    /// `false` when the hold timeout elapsed with no change.
    pub changed: bool,
    pub value: String,
    pub exists: bool,
    /// A newer watch from the same session replaced this one.
    pub canceled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanBinlogRequest {
    pub end_index: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Diagnostic snapshot of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNodeInfo {
    pub server_id: String,
    pub role: Role,
    pub term: i64,
    pub last_log_index: i64,
    pub last_log_term: i64,
    pub commit_index: i64,
    pub last_applied: i64,
}
