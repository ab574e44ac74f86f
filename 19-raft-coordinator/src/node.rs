//! Consensus node.
//!
//! A [`RaftNode`] owns the durable log, the term/vote record and the applied
//! state, and drives them with a handful of background tasks:
//!
//! - **election timer**: turns a silent leader into a new election, with a
//!   deadline re-randomized inside `[election_timeout_min, election_timeout_max]`
//! - **replicator** (one per peer): ships log batches, doubling as the heartbeat
//! - **applier**: applies committed entries in index order, wakes watches and
//!   completes pending client writes
//! - **session sweep** (leader only): proposes `ReleaseSession` for sessions
//!   that stopped sending keepalives
//! - **stats tick**: closes the throughput counters once per interval
//!
//! # Locking
//!
//! Term, vote, role, commit index and per-peer progress live in one
//! [`RaftState`] behind a single mutex, so term changes and commit
//! advancement are serialized. When both are needed, the state lock is taken
//! before the binlog lock, never the other way round. No lock is held across
//! an `.await`.

mod apply;
mod client;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, ensure};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binlog::BinLog;
use crate::command::{LogEntry, LogOp};
use crate::config::NodeConfig;
use crate::error::{TransportError, fatal};
use crate::meta::MetaStore;
use crate::rpc::{
    Ack, AppendEntriesRequest, AppendEntriesResponse, ClusterNodeInfo, Request, Response, Role,
    VoteRequest, VoteResponse,
};
use crate::stats::PerformanceCenter;
use crate::storage::StorageManager;
use crate::transport::{ClusterTransport, RpcHandler};
use crate::watch::WatchRegistry;

pub use apply::ApplyOutcome;
use apply::StateMachine;

struct RaftState {
    role: Role,
    current_term: i64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    commit_index: i64,
    election_deadline: Instant,
    votes: HashSet<String>,
    next_index: HashMap<String, i64>,
    match_index: HashMap<String, i64>,
    /// Last time each peer answered an AppendEntries in the current term.
    last_ack: HashMap<String, Instant>,
    /// Set on election, cleared once this term's no-op is applied.
    safe_mode: bool,
    pending: HashMap<i64, oneshot::Sender<ApplyOutcome>>,
    /// Sessions with a `ReleaseSession` already in the log.
    releasing: HashSet<String>,
}

struct NodeShared {
    id: String,
    config: NodeConfig,
    peers: Vec<String>,
    quorum: usize,
    transport: Arc<dyn ClusterTransport>,
    state: Mutex<RaftState>,
    binlog: Mutex<BinLog>,
    meta: MetaStore,
    machine: StateMachine,
    watches: WatchRegistry,
    stats: PerformanceCenter,
    peer_wakeups: HashMap<String, Arc<Notify>>,
    commit_notify: Notify,
    applied_tx: watch::Sender<i64>,
    /// Bumped whenever a peer acknowledges the leader.
    contact_tx: watch::Sender<u64>,
    shutdown: CancellationToken,
}

enum ReplicateStep {
    Idle,
    More,
    Backoff,
}

/// Handle to a running node. Cheap to clone; every clone drives the same node.
#[derive(Clone)]
pub struct RaftNode {
    shared: Arc<NodeShared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RaftNode {
    /// Opens the node's durable state and spawns its background tasks.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(config: NodeConfig, transport: Arc<dyn ClusterTransport>) -> Result<Self> {
        config.validate()?;
        let binlog = BinLog::open(&config.binlog_dir)?;
        let meta = MetaStore::open(&config.data_dir)?;
        let storage = StorageManager::open(&config.data_dir)?;
        let machine = StateMachine::new(storage, config.session_expire_timeout)?;

        let current_term = meta.current_term()?;
        let voted_for = meta.voted_for(current_term)?;
        let last_applied = machine.last_applied();
        ensure!(
            last_applied < binlog.len(),
            "applied index {last_applied} is beyond the log length {}",
            binlog.len()
        );

        let peers = config.peers();
        let quorum = config.members.len() / 2 + 1;
        let peer_wakeups = peers
            .iter()
            .map(|peer| (peer.clone(), Arc::new(Notify::new())))
            .collect();
        // A lone member has nobody to wait for.
        let election_deadline = if peers.is_empty() {
            Instant::now()
        } else {
            random_deadline(&config)
        };

        info!(
            server_id = %config.server_id,
            term = current_term,
            log_length = binlog.len(),
            last_applied,
            "node starting"
        );

        let state = RaftState {
            role: Role::Follower,
            current_term,
            voted_for,
            leader_id: None,
            commit_index: last_applied,
            election_deadline,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_ack: HashMap::new(),
            safe_mode: false,
            pending: HashMap::new(),
            releasing: HashSet::new(),
        };

        let shared = Arc::new(NodeShared {
            id: config.server_id.clone(),
            stats: PerformanceCenter::new(config.performance_buffer_size),
            peers: peers.clone(),
            quorum,
            transport,
            state: Mutex::new(state),
            binlog: Mutex::new(binlog),
            meta,
            machine,
            watches: WatchRegistry::default(),
            peer_wakeups,
            commit_notify: Notify::new(),
            applied_tx: watch::Sender::new(last_applied),
            contact_tx: watch::Sender::new(0),
            shutdown: CancellationToken::new(),
            config,
        });

        let mut tasks = vec![
            tokio::spawn(run_election_timer(Arc::clone(&shared))),
            tokio::spawn(run_applier(Arc::clone(&shared))),
            tokio::spawn(run_session_sweep(Arc::clone(&shared))),
            tokio::spawn(run_stats_tick(Arc::clone(&shared))),
        ];
        for peer in peers {
            tasks.push(tokio::spawn(run_replicator(Arc::clone(&shared), peer)));
        }

        Ok(Self {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn is_leader(&self) -> bool {
        self.shared.state.lock().role == Role::Leader
    }

    pub fn leader_id(&self) -> Option<String> {
        self.shared.state.lock().leader_id.clone()
    }

    pub fn status(&self) -> ClusterNodeInfo {
        self.shared.status()
    }

    /// Stops every background task. Pending client writes fail with a redirect.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut state = self.shared.state.lock();
        state.pending.clear();
        info!(server_id = %self.shared.id, "node stopped");
    }

    /// Administrative truncate: discards every local slot above `index`.
    ///
    /// Refused on a leader and for anything that would drop a committed entry.
    pub fn rollback(&self, index: i64) -> Result<()> {
        let state = self.shared.state.lock();
        ensure!(state.role != Role::Leader, "cannot roll back the leader's log");
        ensure!(
            index >= state.commit_index,
            "cannot roll back to {index}, entries up to {} are committed",
            state.commit_index
        );
        self.shared.binlog.lock().truncate(index)?;
        warn!(index, "log rolled back");
        Ok(())
    }
}

#[async_trait]
impl RpcHandler for RaftNode {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Vote(req) => Response::Vote(self.shared.handle_vote(req)),
            Request::AppendEntries(req) => {
                Response::AppendEntries(self.shared.handle_append_entries(req))
            }
            Request::Put(req) => Response::Put(self.put(req).await),
            Request::Get(req) => Response::Get(self.get(req).await),
            Request::Delete(req) => Response::Delete(self.delete(req).await),
            Request::Scan(req) => Response::Scan(self.scan(req).await),
            Request::KeepAlive(req) => Response::KeepAlive(self.keep_alive(req).await),
            Request::Lock(req) => Response::Lock(self.lock(req).await),
            Request::UnLock(req) => Response::UnLock(self.unlock(req).await),
            Request::Watch(req) => Response::Watch(self.watch(req).await),
            Request::ShowStatus => Response::ShowStatus(self.status()),
            Request::ShowStatistics => Response::ShowStatistics(self.shared.stats.snapshot()),
            Request::CleanBinlog(req) => Response::CleanBinlog(self.clean_binlog(req)),
        }
    }
}

/// Next index to try after a peer rejected an append that started at `next`.
/// Jumps straight to the end of a short log, otherwise steps back one slot.
fn backtrack(next: i64, follower_length: i64) -> i64 {
    (next - 1).min(follower_length).max(0)
}

fn random_deadline(config: &NodeConfig) -> Instant {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    let timeout = rand::thread_rng().gen_range(min..=max);
    Instant::now() + Duration::from_millis(timeout)
}

impl NodeShared {
    fn status(&self) -> ClusterNodeInfo {
        let state = self.state.lock();
        let (last_log_index, last_log_term) = self.binlog.lock().last_index_and_term();
        ClusterNodeInfo {
            server_id: self.id.clone(),
            role: state.role,
            term: state.current_term,
            last_log_index,
            last_log_term,
            commit_index: state.commit_index,
            last_applied: self.machine.last_applied(),
        }
    }

    fn wake_replicators(&self) {
        for wakeup in self.peer_wakeups.values() {
            wakeup.notify_one();
        }
    }

    /// Adopts `term` (if newer) and becomes a follower.
    fn step_down(&self, state: &mut RaftState, term: i64) {
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            if let Err(err) = self.meta.set_current_term(term) {
                fatal("failed to persist current_term", &err);
            }
        }
        if state.role != Role::Follower {
            info!(term, role = %state.role, "stepping down to follower");
        }
        state.role = Role::Follower;
        state.safe_mode = false;
        state.votes.clear();
        state.pending.clear();
        state.releasing.clear();
        state.election_deadline = random_deadline(&self.config);
    }

    /// Starts a new term if the election deadline passed. Returns the ballot
    /// to send to every peer, or `None` when there is nothing to ask.
    fn begin_election(&self) -> Option<VoteRequest> {
        let mut state = self.state.lock();
        if state.role == Role::Leader || Instant::now() < state.election_deadline {
            return None;
        }
        state.current_term += 1;
        state.role = Role::Candidate;
        state.leader_id = None;
        state.voted_for = Some(self.id.clone());
        state.votes = HashSet::from([self.id.clone()]);
        state.election_deadline = random_deadline(&self.config);
        if let Err(err) = self.meta.set_voted_for(state.current_term, &self.id) {
            fatal("failed to persist self vote", &err);
        }
        info!(term = state.current_term, "election timeout, starting election");

        if state.votes.len() >= self.quorum {
            self.become_leader(&mut state);
            return None;
        }
        let (last_log_index, last_log_term) = self.binlog.lock().last_index_and_term();
        Some(VoteRequest {
            term: state.current_term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        })
    }

    async fn request_vote(self: Arc<Self>, peer: String, request: VoteRequest) {
        let term = request.term;
        let response = match self.transport.call(&peer, Request::Vote(request)).await {
            Ok(Response::Vote(response)) => response,
            Ok(other) => {
                warn!(peer = %peer, response = ?other, "unexpected vote response");
                return;
            }
            Err(err) => {
                debug!(peer = %peer, error = %err, "vote request failed");
                return;
            }
        };

        let mut state = self.state.lock();
        if response.term > state.current_term {
            self.step_down(&mut state, response.term);
            return;
        }
        if state.role != Role::Candidate || state.current_term != term || !response.vote_granted {
            return;
        }
        state.votes.insert(peer);
        if state.votes.len() >= self.quorum {
            self.become_leader(&mut state);
        }
    }

    fn become_leader(&self, state: &mut RaftState) {
        state.role = Role::Leader;
        state.leader_id = Some(self.id.clone());
        state.safe_mode = true;
        state.votes.clear();
        state.releasing.clear();
        state.last_ack.clear();

        let mut binlog = self.binlog.lock();
        let length = binlog.len();
        for peer in &self.peers {
            state.next_index.insert(peer.clone(), length);
            state.match_index.insert(peer.clone(), -1);
        }
        if let Err(err) = binlog.append(&LogEntry::nop(state.current_term)) {
            fatal("failed to append no-op entry", &err);
        }
        drop(binlog);

        self.machine.reset_sessions();
        info!(
            term = state.current_term,
            sessions = self.machine.session_count(),
            "won election, now leader"
        );
        self.advance_commit(state);
        self.wake_replicators();
    }

    /// Moves the commit index to the highest index stored on a majority,
    /// provided that entry belongs to the current term.
    fn advance_commit(&self, state: &mut RaftState) {
        if state.role != Role::Leader {
            return;
        }
        let binlog = self.binlog.lock();
        let mut matched: Vec<i64> = self
            .peers
            .iter()
            .map(|peer| state.match_index.get(peer).copied().unwrap_or(-1))
            .collect();
        matched.push(binlog.len() - 1);
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.quorum - 1];
        if candidate <= state.commit_index {
            return;
        }
        match binlog.term_at(candidate) {
            Ok(term) if term == state.current_term => {
                debug!(from = state.commit_index, to = candidate, "commit index advanced");
                state.commit_index = candidate;
                self.commit_notify.notify_one();
            }
            Ok(_) => {}
            Err(err) => fatal("failed to read term of a replicated slot", &err),
        }
    }

    fn handle_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock();
        if request.term < state.current_term {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }
        if request.term > state.current_term {
            self.step_down(&mut state, request.term);
        }

        let (last_index, last_term) = self.binlog.lock().last_index_and_term();
        let up_to_date = request.last_log_term > last_term
            || (request.last_log_term == last_term && request.last_log_index >= last_index);
        let free = match &state.voted_for {
            None => true,
            Some(candidate) => *candidate == request.candidate_id,
        };
        let granted = up_to_date && free;
        if granted {
            if let Err(err) = self
                .meta
                .set_voted_for(state.current_term, &request.candidate_id)
            {
                fatal("failed to persist vote", &err);
            }
            state.voted_for = Some(request.candidate_id.clone());
            state.election_deadline = random_deadline(&self.config);
            debug!(term = state.current_term, candidate = %request.candidate_id, "vote granted");
        }
        VoteResponse {
            term: state.current_term,
            vote_granted: granted,
        }
    }

    fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock();
        let mut binlog = self.binlog.lock();
        let reject = |term: i64, log_length: i64| AppendEntriesResponse {
            term,
            success: false,
            log_length,
        };

        if request.term < state.current_term {
            return reject(state.current_term, binlog.len());
        }
        if request.term > state.current_term || state.role != Role::Follower {
            self.step_down(&mut state, request.term);
        }
        if state.leader_id.as_deref() != Some(request.leader_id.as_str()) {
            info!(term = request.term, leader = %request.leader_id, "following new leader");
            state.leader_id = Some(request.leader_id.clone());
        }
        state.election_deadline = random_deadline(&self.config);

        let prev = request.prev_log_index;
        if prev >= binlog.len() {
            return reject(state.current_term, binlog.len());
        }
        // Slots below the retained range were applied, hence committed, hence matching.
        if prev >= binlog.first_index() - 1 {
            let local_term = match binlog.term_at(prev) {
                Ok(term) => term,
                Err(err) => fatal("failed to read term for log matching", &err),
            };
            if local_term != request.prev_log_term {
                if prev <= state.commit_index {
                    error!(prev, commit = state.commit_index, "leader disagrees with a committed slot");
                    return reject(state.current_term, binlog.len());
                }
                if let Err(err) = binlog.truncate(prev - 1) {
                    fatal("failed to truncate conflicting suffix", &err);
                }
                return reject(state.current_term, binlog.len());
            }
        }

        let mut index = prev + 1;
        let mut remaining = request.entries.as_slice();
        while let Some((entry, rest)) = remaining.split_first() {
            if index >= binlog.len() {
                break;
            }
            if index >= binlog.first_index() {
                let local_term = match binlog.term_at(index) {
                    Ok(term) => term,
                    Err(err) => fatal("failed to read term for log matching", &err),
                };
                if local_term != entry.term {
                    if let Err(err) = binlog.truncate(index - 1) {
                        fatal("failed to truncate conflicting suffix", &err);
                    }
                    break;
                }
            }
            index += 1;
            remaining = rest;
        }
        if !remaining.is_empty() {
            if let Err(err) = binlog.append_batch(remaining) {
                fatal("failed to append replicated entries", &err);
            }
        }

        let last_new = prev + request.entries.len() as i64;
        let commit = request.leader_commit_index.min(last_new);
        if commit > state.commit_index {
            state.commit_index = commit;
            self.commit_notify.notify_one();
        }
        AppendEntriesResponse {
            term: state.current_term,
            success: true,
            log_length: binlog.len(),
        }
    }

    async fn replicate_to(&self, peer: &str) -> ReplicateStep {
        let (request, match_if_ok) = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return ReplicateStep::Idle;
            }
            let binlog = self.binlog.lock();
            let next = state.next_index.get(peer).copied().unwrap_or(binlog.len());
            if next < binlog.first_index() {
                error!(
                    peer,
                    next,
                    first = binlog.first_index(),
                    "follower needs slots that were cleaned; skipping it"
                );
                return ReplicateStep::Backoff;
            }
            let prev_log_term = match binlog.term_at(next - 1) {
                Ok(term) => term,
                Err(err) => fatal("failed to read previous slot for replication", &err),
            };
            let entries = match binlog.read_range(next, self.config.log_rep_batch_max) {
                Ok(entries) => entries,
                Err(err) => fatal("failed to read slots for replication", &err),
            };
            let match_if_ok = next - 1 + entries.len() as i64;
            let request = AppendEntriesRequest {
                term: state.current_term,
                leader_id: self.id.clone(),
                prev_log_index: next - 1,
                prev_log_term,
                entries,
                leader_commit_index: state.commit_index,
            };
            (request, match_if_ok)
        };

        let term = request.term;
        let response = match self
            .transport
            .call(peer, Request::AppendEntries(request))
            .await
        {
            Ok(Response::AppendEntries(response)) => response,
            Ok(other) => {
                warn!(peer, response = ?other, "unexpected append response");
                return ReplicateStep::Idle;
            }
            Err(TransportError::Unreachable(_)) => {
                debug!(peer, "peer unreachable, backing off");
                return ReplicateStep::Backoff;
            }
            Err(err) => {
                debug!(peer, error = %err, "append entries failed");
                return ReplicateStep::Idle;
            }
        };

        let mut state = self.state.lock();
        if response.term > state.current_term {
            self.step_down(&mut state, response.term);
            return ReplicateStep::Idle;
        }
        if state.role != Role::Leader || state.current_term != term {
            return ReplicateStep::Idle;
        }
        state.last_ack.insert(peer.to_string(), Instant::now());
        self.contact_tx.send_modify(|seen| *seen += 1);

        if response.success {
            state.match_index.insert(peer.to_string(), match_if_ok);
            state.next_index.insert(peer.to_string(), match_if_ok + 1);
            self.advance_commit(&mut state);
            if match_if_ok + 1 < self.binlog.lock().len() {
                ReplicateStep::More
            } else {
                ReplicateStep::Idle
            }
        } else {
            let next = state.next_index.get(peer).copied().unwrap_or(0);
            state
                .next_index
                .insert(peer.to_string(), backtrack(next, response.log_length));
            ReplicateStep::More
        }
    }

    /// Applies everything between the applied index and the commit index.
    fn apply_committed(&self) {
        loop {
            let commit = self.state.lock().commit_index;
            let applied = self.machine.last_applied();
            if applied >= commit {
                return;
            }
            let want = ((commit - applied) as usize).min(self.config.log_rep_batch_max);
            let entries = match self.binlog.lock().read_range(applied + 1, want) {
                Ok(entries) if !entries.is_empty() => entries,
                Ok(_) => fatal(
                    "committed slots are missing from the log",
                    &anyhow::anyhow!("applied {applied}, commit {commit}"),
                ),
                Err(err) => fatal("failed to read committed slots", &err),
            };

            for (offset, entry) in entries.into_iter().enumerate() {
                let index = applied + 1 + offset as i64;
                let result = match self.machine.apply(index, &entry) {
                    Ok(result) => result,
                    Err(err) => fatal("failed to apply committed entry", &err),
                };
                for (ns, key) in &result.touched {
                    self.watches.notify_change(ns, key);
                }
                self.applied_tx.send_replace(index);

                let mut state = self.state.lock();
                if entry.op == LogOp::Nop
                    && state.safe_mode
                    && state.role == Role::Leader
                    && entry.term == state.current_term
                {
                    state.safe_mode = false;
                    info!(term = state.current_term, index, "leader left safe mode");
                }
                if entry.op == LogOp::ReleaseSession {
                    state.releasing.remove(&entry.key);
                }
                if let Some(waiter) = state.pending.remove(&index) {
                    let _ = waiter.send(result.outcome);
                }
            }
        }
    }

    /// Appends `entry` (stamped with the current term) if this node leads and
    /// has room for it; the receiver resolves once the entry is applied.
    fn propose(
        &self,
        op: LogOp,
        user: &str,
        key: &str,
        value: &str,
    ) -> Result<oneshot::Receiver<ApplyOutcome>, Ack> {
        let mut state = self.state.lock();
        if state.role != Role::Leader {
            return Err(Ack::redirect(state.leader_id.clone()));
        }
        let mut binlog = self.binlog.lock();
        let unapplied = binlog.len() - 1 - self.machine.last_applied();
        if state.pending.len() >= self.config.max_pending_writes
            || unapplied >= self.config.max_unapplied_entries
        {
            warn!(pending = state.pending.len(), unapplied, "write rejected, leader busy");
            return Err(Ack::busy());
        }
        let entry = LogEntry::new(op, user, key, value, state.current_term);
        let index = match binlog.append(&entry) {
            Ok(index) => index,
            Err(err) => fatal("failed to append client entry", &err),
        };
        drop(binlog);

        let (tx, rx) = oneshot::channel();
        state.pending.insert(index, tx);
        self.advance_commit(&mut state);
        self.wake_replicators();
        Ok(rx)
    }

    /// Proposes and waits for the entry to be applied.
    async fn submit(
        &self,
        op: LogOp,
        user: &str,
        key: &str,
        value: &str,
    ) -> Result<ApplyOutcome, Ack> {
        let rx = self.propose(op, user, key, value)?;
        match rx.await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(Ack::redirect(self.state.lock().leader_id.clone())),
        }
    }

    fn expire_sessions(&self) {
        {
            let state = self.state.lock();
            if state.role != Role::Leader || state.safe_mode {
                return;
            }
        }
        for session in self.machine.expired_sessions() {
            if !self.state.lock().releasing.insert(session.clone()) {
                continue;
            }
            match self.propose(LogOp::ReleaseSession, "", &session, "") {
                Ok(_) => info!(session = %session, "session expired, releasing its locks"),
                Err(_) => {
                    self.state.lock().releasing.remove(&session);
                }
            }
        }
    }

    /// Confirms this node still leads by hearing from a majority recently.
    async fn confirm_leadership(&self) -> bool {
        let started = Instant::now();
        let mut contact = self.contact_tx.subscribe();
        let recent = started.checked_sub(self.config.election_timeout_min);
        {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return false;
            }
            if recent.is_some_and(|since| self.acked_since(&state, since)) {
                return true;
            }
        }
        self.wake_replicators();
        let deadline = started + self.config.rpc_timeout;
        loop {
            {
                let state = self.state.lock();
                if state.role != Role::Leader {
                    return false;
                }
                if self.acked_since(&state, started) {
                    return true;
                }
            }
            tokio::select! {
                changed = contact.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = sleep_until(deadline) => return false,
            }
        }
    }

    fn acked_since(&self, state: &RaftState, since: Instant) -> bool {
        let acked = self
            .peers
            .iter()
            .filter(|peer| state.last_ack.get(*peer).is_some_and(|at| *at >= since))
            .count();
        acked + 1 >= self.quorum
    }

    /// Waits until the applied index reaches `index`.
    async fn wait_applied(&self, index: i64) -> bool {
        let mut applied = self.applied_tx.subscribe();
        let waited =
            tokio::time::timeout(self.config.rpc_timeout, applied.wait_for(|seen| *seen >= index))
                .await;
        matches!(waited, Ok(Ok(_)))
    }
}

async fn run_election_timer(shared: Arc<NodeShared>) {
    loop {
        let wake_at = {
            let state = shared.state.lock();
            if state.role == Role::Leader {
                Instant::now() + shared.config.election_timeout_min
            } else {
                state.election_deadline
            }
        };
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = sleep_until(wake_at) => {}
        }
        if let Some(request) = shared.begin_election() {
            for peer in &shared.peers {
                let shared = Arc::clone(&shared);
                let peer = peer.clone();
                let request = request.clone();
                tokio::spawn(async move { shared.request_vote(peer, request).await });
            }
        }
    }
}

async fn run_replicator(shared: Arc<NodeShared>, peer: String) {
    let Some(wakeup) = shared.peer_wakeups.get(&peer).cloned() else {
        return;
    };
    let mut immediate = false;
    loop {
        if !immediate {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = wakeup.notified() => {}
                _ = sleep(shared.config.heartbeat_interval) => {}
            }
        }
        immediate = match shared.replicate_to(&peer).await {
            ReplicateStep::Idle => false,
            ReplicateStep::More => true,
            ReplicateStep::Backoff => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = sleep(shared.config.replication_retry_timespan) => {}
                }
                false
            }
        };
    }
}

async fn run_applier(shared: Arc<NodeShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.commit_notify.notified() => {}
            _ = sleep(shared.config.heartbeat_interval) => {}
        }
        shared.apply_committed();
    }
}

async fn run_session_sweep(shared: Arc<NodeShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = sleep(shared.config.session_sweep_interval) => {}
        }
        shared.expire_sessions();
    }
}

async fn run_stats_tick(shared: Arc<NodeShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = sleep(shared.config.performance_interval) => {}
        }
        shared.stats.tick();
    }
}
