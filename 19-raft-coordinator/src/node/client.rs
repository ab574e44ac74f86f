//! Client-facing operations.

use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use super::{ApplyOutcome, RaftNode};
use crate::command::LogOp;
use crate::rpc::{
    Ack, CleanBinlogRequest, DeleteRequest, GetRequest, GetResponse, KeepAliveRequest,
    LockRequest, LockResponse, PutRequest, Role, ScanRequest, ScanResponse, UnLockRequest,
    WatchRequest, WatchResponse,
};
use crate::stats::StatOp;

impl RaftNode {
    pub(super) async fn put(&self, req: PutRequest) -> Ack {
        self.shared.stats.record(StatOp::Put);
        self.write(LogOp::Put, &req.user, &req.key, &req.value).await
    }

    pub(super) async fn delete(&self, req: DeleteRequest) -> Ack {
        self.shared.stats.record(StatOp::Delete);
        self.write(LogOp::Delete, &req.user, &req.key, "").await
    }

    pub(super) async fn keep_alive(&self, req: KeepAliveRequest) -> Ack {
        self.shared.stats.record(StatOp::KeepAlive);
        debug!(session = %req.session_id, "keepalive");
        self.write(LogOp::KeepAlive, "", &req.session_id, "").await
    }

    pub(super) async fn unlock(&self, req: UnLockRequest) -> Ack {
        self.shared.stats.record(StatOp::UnLock);
        self.write(LogOp::UnLock, &req.user, &req.key, &req.session_id)
            .await
    }

    async fn write(&self, op: LogOp, user: &str, key: &str, value: &str) -> Ack {
        match self.shared.submit(op, user, key, value).await {
            Ok(_) => Ack::ok(),
            Err(ack) => ack,
        }
    }

    pub(super) async fn lock(&self, req: LockRequest) -> LockResponse {
        self.shared.stats.record(StatOp::Lock);
        if let Err(ack) = self.leader_gate() {
            return LockResponse {
                ack,
                acquired: false,
            };
        }
        match self
            .shared
            .submit(LogOp::Lock, &req.user, &req.key, &req.session_id)
            .await
        {
            Ok(outcome) => LockResponse {
                ack: Ack::ok(),
                acquired: outcome == ApplyOutcome::LockGranted,
            },
            Err(ack) => LockResponse {
                ack,
                acquired: false,
            },
        }
    }

    pub(super) async fn get(&self, req: GetRequest) -> GetResponse {
        self.shared.stats.record(StatOp::Get);
        if let Err(ack) = self.read_barrier(req.stale_ok).await {
            return GetResponse {
                ack,
                hit: false,
                value: String::new(),
            };
        }
        match self.shared.machine.get(&req.user, &req.key) {
            Ok(Some(value)) => GetResponse {
                ack: Ack::ok(),
                hit: true,
                value,
            },
            Ok(None) => GetResponse {
                ack: Ack::ok(),
                hit: false,
                value: String::new(),
            },
            Err(err) => {
                warn!(error = ?err, key = %req.key, "get failed");
                GetResponse {
                    ack: Ack::failed(),
                    hit: false,
                    value: String::new(),
                }
            }
        }
    }

    pub(super) async fn scan(&self, req: ScanRequest) -> ScanResponse {
        self.shared.stats.record(StatOp::Scan);
        if let Err(ack) = self.read_barrier(req.stale_ok).await {
            return ScanResponse {
                ack,
                items: Vec::new(),
                has_more: false,
            };
        }
        let limit = req.size_limit.clamp(1, self.shared.config.max_scan_items);
        match self
            .shared
            .machine
            .scan(&req.user, &req.start_key, &req.end_key, limit)
        {
            Ok((items, has_more)) => ScanResponse {
                ack: Ack::ok(),
                items,
                has_more,
            },
            Err(err) => {
                warn!(error = ?err, start = %req.start_key, "scan failed");
                ScanResponse {
                    ack: Ack::failed(),
                    items: Vec::new(),
                    has_more: false,
                }
            }
        }
    }

    /// Redirects non-leaders and asks clients to retry while in safe mode.
    fn leader_gate(&self) -> Result<(), Ack> {
        let state = self.shared.state.lock();
        if state.role != Role::Leader {
            return Err(Ack::redirect(state.leader_id.clone()));
        }
        if state.safe_mode {
            return Err(Ack::busy());
        }
        Ok(())
    }

    /// Makes local applied state safe to read: either the caller accepts a
    /// stale answer from any member, or this leader confirms its term with a
    /// majority and catches up to the commit index it saw.
    async fn read_barrier(&self, stale_ok: bool) -> Result<(), Ack> {
        if stale_ok && !self.is_leader() {
            return Ok(());
        }
        self.leader_gate()?;
        let read_index = self.shared.state.lock().commit_index;
        if !self.shared.confirm_leadership().await {
            return Err(Ack::redirect(self.leader_id()));
        }
        if !self.shared.wait_applied(read_index).await {
            return Err(Ack::busy());
        }
        Ok(())
    }

    pub(super) async fn watch(&self, req: WatchRequest) -> WatchResponse {
        self.shared.stats.record(StatOp::Watch);
        let shared = &self.shared;
        let ticket = shared
            .watches
            .register(&req.user, &req.key, &req.session_id);
        let hold_until = Instant::now() + shared.config.watch_hold_timeout;

        let response = loop {
            if ticket.signal.is_canceled() {
                break watch_response(false, String::new(), false, true);
            }
            let current = match shared.machine.get(&req.user, &req.key) {
                Ok(current) => current,
                Err(err) => {
                    warn!(error = ?err, key = %req.key, "watch read failed");
                    break WatchResponse {
                        ack: Ack::failed(),
                        changed: false,
                        value: String::new(),
                        exists: false,
                        canceled: false,
                    };
                }
            };
            let exists = current.is_some();
            let value = current.unwrap_or_default();
            if exists != req.key_exists || value != req.old_value || ticket.signal.child_changed() {
                debug!(key = %req.key, exists, "watch fired");
                break watch_response(true, value, exists, false);
            }
            if Instant::now() >= hold_until {
                break watch_response(false, value, exists, false);
            }
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    break watch_response(false, value, exists, true);
                }
                _ = ticket.signal.changed() => {}
                _ = sleep(shared.config.watch_poll_interval) => {}
                _ = sleep_until(hold_until) => {}
            }
        };

        shared.watches.unregister(&ticket);
        response
    }

    pub(super) fn clean_binlog(&self, req: CleanBinlogRequest) -> Ack {
        let last_applied = self.shared.machine.last_applied();
        if req.end_index > last_applied + 1 {
            warn!(end_index = req.end_index, last_applied, "refusing to clean unapplied slots");
            return Ack::failed();
        }
        match self.shared.binlog.lock().remove_prefix(req.end_index) {
            Ok(()) => Ack::ok(),
            Err(err) => {
                warn!(error = ?err, end_index = req.end_index, "clean binlog failed");
                Ack::failed()
            }
        }
    }
}

fn watch_response(changed: bool, value: String, exists: bool, canceled: bool) -> WatchResponse {
    WatchResponse {
        ack: Ack::ok(),
        changed,
        value,
        exists,
        canceled,
    }
}
