//! Deterministic application of committed entries.
//!
//! Values are stored as `[op byte][payload]`: a `Put` keeps the user value,
//! a `Lock` keeps the holder's session id. Lock decisions only look at
//! replicated facts (the stored holder and whether its session still exists),
//! so every replica grants and rejects the same requests.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;

use crate::command::{LogEntry, LogOp};
use crate::session::SessionTable;
use crate::storage::{StorageManager, WriteBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Done,
    LockGranted,
    LockRejected,
}

#[derive(Debug)]
pub(crate) struct Applied {
    pub outcome: ApplyOutcome,
    /// `(namespace, key)` pairs whose value or existence changed.
    pub touched: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoredValue {
    Plain(String),
    Lock { holder: String },
}

impl StoredValue {
    fn encode(op: LogOp, payload: &str) -> Vec<u8> {
        let mut raw = Vec::with_capacity(1 + payload.len());
        raw.push(op.as_byte());
        raw.extend_from_slice(payload.as_bytes());
        raw
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        let Some((&op, payload)) = raw.split_first() else {
            bail!("empty stored value");
        };
        let payload = String::from_utf8(payload.to_vec()).context("stored value is not utf-8")?;
        match LogOp::from_byte(op)? {
            LogOp::Lock => Ok(StoredValue::Lock { holder: payload }),
            _ => Ok(StoredValue::Plain(payload)),
        }
    }
}

pub(crate) struct StateMachine {
    storage: StorageManager,
    sessions: Mutex<SessionTable>,
    session_timeout: Duration,
}

impl StateMachine {
    pub fn new(storage: StorageManager, session_timeout: Duration) -> Result<Self> {
        let sessions = SessionTable::restore(storage.sessions()?, Instant::now());
        Ok(Self {
            storage,
            sessions: Mutex::new(sessions),
            session_timeout,
        })
    }

    pub fn last_applied(&self) -> i64 {
        self.storage.last_applied()
    }

    /// Applies entry `index`. Entries at or below the persisted applied index
    /// are skipped, which makes replay after a restart harmless.
    pub fn apply(&self, index: i64, entry: &LogEntry) -> Result<Applied> {
        let mut applied = Applied {
            outcome: ApplyOutcome::Done,
            touched: Vec::new(),
        };
        if index <= self.storage.last_applied() {
            return Ok(applied);
        }

        let now = Instant::now();
        let mut batch = WriteBatch::default();
        let ns = entry.user.as_str();
        match entry.op {
            LogOp::Put => {
                batch.put(ns, &entry.key, StoredValue::encode(LogOp::Put, &entry.value));
                applied.touched.push((entry.user.clone(), entry.key.clone()));
            }
            LogOp::Delete => {
                batch.delete(ns, &entry.key);
                applied.touched.push((entry.user.clone(), entry.key.clone()));
            }
            LogOp::Nop => {}
            LogOp::KeepAlive => {
                let session = entry.key.as_str();
                if self.sessions.lock().touch(session, now) {
                    batch.put_session(session, Vec::new());
                }
            }
            LogOp::Lock => {
                let session = entry.value.as_str();
                let mut sessions = self.sessions.lock();
                // An ordinary value is never replaced by a lock.
                let granted = match self.stored(ns, &entry.key)? {
                    None => true,
                    Some(StoredValue::Plain(_)) => false,
                    Some(StoredValue::Lock { holder }) => {
                        holder == session || !sessions.contains(&holder)
                    }
                };
                if granted {
                    batch.put(ns, &entry.key, StoredValue::encode(LogOp::Lock, session));
                    let held = sessions.add_key(session, ns, &entry.key, now);
                    batch.put_session(session, held);
                    applied.touched.push((entry.user.clone(), entry.key.clone()));
                    applied.outcome = ApplyOutcome::LockGranted;
                } else {
                    applied.outcome = ApplyOutcome::LockRejected;
                }
            }
            LogOp::UnLock => {
                let session = entry.value.as_str();
                if self.lock_holder(ns, &entry.key)?.as_deref() == Some(session) {
                    batch.delete(ns, &entry.key);
                    if let Some(held) = self.sessions.lock().remove_key(session, ns, &entry.key) {
                        batch.put_session(session, held);
                    }
                    applied.touched.push((entry.user.clone(), entry.key.clone()));
                }
            }
            LogOp::ReleaseSession => {
                let session = entry.key.as_str();
                if let Some(held) = self.sessions.lock().remove(session) {
                    for (held_ns, key) in held {
                        if self.lock_holder(&held_ns, &key)?.as_deref() == Some(session) {
                            batch.delete(&held_ns, &key);
                            applied.touched.push((held_ns, key));
                        }
                    }
                    batch.delete_session(session);
                }
            }
        }

        self.storage.apply_batch(index, &batch)?;
        Ok(applied)
    }

    fn stored(&self, ns: &str, key: &str) -> Result<Option<StoredValue>> {
        match self.storage.get(ns, key)? {
            Some(raw) => Ok(Some(StoredValue::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn lock_holder(&self, ns: &str, key: &str) -> Result<Option<String>> {
        match self.stored(ns, key)? {
            Some(StoredValue::Lock { holder }) => Ok(Some(holder)),
            _ => Ok(None),
        }
    }

    /// Reads a key the way clients see it: locks whose holder is no longer
    /// alive read as missing, a live lock reads as its holder's session id.
    pub fn get(&self, ns: &str, key: &str) -> Result<Option<String>> {
        let Some(raw) = self.storage.get(ns, key)? else {
            return Ok(None);
        };
        Ok(self.visible(StoredValue::decode(&raw)?, Instant::now()))
    }

    /// Visible pairs in `[start, end)` (empty `end` is unbounded), at most
    /// `limit` of them, plus whether more remain.
    pub fn scan(
        &self,
        ns: &str,
        start: &str,
        end: &str,
        limit: usize,
    ) -> Result<(Vec<(String, String)>, bool)> {
        let now = Instant::now();
        let mut iter = self.storage.iter(ns);
        iter.seek(start)?;
        let mut items = Vec::new();
        while iter.valid() && (end.is_empty() || iter.key() < end) {
            if items.len() >= limit {
                return Ok((items, true));
            }
            if let Some(value) = self.visible(StoredValue::decode(iter.value())?, now) {
                items.push((iter.key().to_string(), value));
            }
            iter.next()?;
        }
        Ok((items, false))
    }

    fn visible(&self, value: StoredValue, now: Instant) -> Option<String> {
        match value {
            StoredValue::Plain(value) => Some(value),
            StoredValue::Lock { holder } => self
                .sessions
                .lock()
                .is_live(&holder, now, self.session_timeout)
                .then_some(holder),
        }
    }

    pub fn reset_sessions(&self) {
        self.sessions.lock().reset_all(Instant::now());
    }

    pub fn expired_sessions(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expired(Instant::now(), self.session_timeout)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(dir: &std::path::Path) -> StateMachine {
        StateMachine::new(StorageManager::open(dir).unwrap(), Duration::from_secs(6)).unwrap()
    }

    fn lock(key: &str, session: &str) -> LogEntry {
        LogEntry::new(LogOp::Lock, "", key, session, 1)
    }

    #[test]
    fn put_then_delete_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let sm = machine(dir.path());
        let put = sm
            .apply(0, &LogEntry::new(LogOp::Put, "", "a", "1", 1))
            .unwrap();
        assert_eq!(put.touched, vec![("".to_string(), "a".to_string())]);
        assert_eq!(sm.get("", "a").unwrap().as_deref(), Some("1"));

        sm.apply(1, &LogEntry::new(LogOp::Delete, "", "a", "", 1))
            .unwrap();
        assert_eq!(sm.get("", "a").unwrap(), None);
        assert_eq!(sm.last_applied(), 1);
    }

    #[test]
    fn replayed_index_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sm = machine(dir.path());
        sm.apply(0, &LogEntry::new(LogOp::Put, "", "a", "1", 1))
            .unwrap();
        let replay = sm
            .apply(0, &LogEntry::new(LogOp::Put, "", "a", "2", 1))
            .unwrap();
        assert!(replay.touched.is_empty());
        assert_eq!(sm.get("", "a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn lock_is_exclusive_until_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let sm = machine(dir.path());
        assert_eq!(sm.apply(0, &lock("k", "s1")).unwrap().outcome, ApplyOutcome::LockGranted);
        assert_eq!(sm.apply(1, &lock("k", "s1")).unwrap().outcome, ApplyOutcome::LockGranted);
        assert_eq!(sm.apply(2, &lock("k", "s2")).unwrap().outcome, ApplyOutcome::LockRejected);
        assert_eq!(sm.get("", "k").unwrap().as_deref(), Some("s1"));

        // Only the holder can unlock.
        sm.apply(3, &LogEntry::new(LogOp::UnLock, "", "k", "s2", 1))
            .unwrap();
        assert_eq!(sm.get("", "k").unwrap().as_deref(), Some("s1"));
        sm.apply(4, &LogEntry::new(LogOp::UnLock, "", "k", "s1", 1))
            .unwrap();
        assert_eq!(sm.apply(5, &lock("k", "s2")).unwrap().outcome, ApplyOutcome::LockGranted);
    }

    #[test]
    fn lock_never_replaces_an_ordinary_value() {
        let dir = tempfile::tempdir().unwrap();
        let sm = machine(dir.path());
        sm.apply(0, &LogEntry::new(LogOp::Put, "", "cfg", "important", 1))
            .unwrap();
        let refused = sm.apply(1, &lock("cfg", "s1")).unwrap();
        assert_eq!(refused.outcome, ApplyOutcome::LockRejected);
        assert!(refused.touched.is_empty());
        assert_eq!(sm.get("", "cfg").unwrap().as_deref(), Some("important"));

        // Unlock on an ordinary value leaves it alone too.
        sm.apply(2, &LogEntry::new(LogOp::UnLock, "", "cfg", "s1", 1))
            .unwrap();
        assert_eq!(sm.get("", "cfg").unwrap().as_deref(), Some("important"));

        sm.apply(3, &LogEntry::new(LogOp::Delete, "", "cfg", "", 1))
            .unwrap();
        assert_eq!(sm.apply(4, &lock("cfg", "s1")).unwrap().outcome, ApplyOutcome::LockGranted);
    }

    #[test]
    fn release_session_frees_its_locks_once() {
        let dir = tempfile::tempdir().unwrap();
        let sm = machine(dir.path());
        sm.apply(0, &lock("a", "s1")).unwrap();
        sm.apply(1, &LogEntry::new(LogOp::Lock, "ns", "b", "s1", 1))
            .unwrap();

        let release = LogEntry::new(LogOp::ReleaseSession, "", "s1", "", 1);
        let first = sm.apply(2, &release).unwrap();
        assert_eq!(first.touched.len(), 2);
        assert_eq!(sm.get("", "a").unwrap(), None);
        assert_eq!(sm.get("ns", "b").unwrap(), None);
        assert_eq!(sm.session_count(), 0);

        let second = sm.apply(3, &release).unwrap();
        assert!(second.touched.is_empty());
        assert_eq!(sm.apply(4, &lock("a", "s2")).unwrap().outcome, ApplyOutcome::LockGranted);
    }

    #[test]
    fn sessions_and_locks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sm = machine(dir.path());
            sm.apply(0, &LogEntry::new(LogOp::KeepAlive, "", "s1", "", 1))
                .unwrap();
            sm.apply(1, &lock("k", "s1")).unwrap();
        }
        let sm = machine(dir.path());
        assert_eq!(sm.session_count(), 1);
        assert_eq!(sm.last_applied(), 1);
        assert_eq!(sm.apply(2, &lock("k", "s2")).unwrap().outcome, ApplyOutcome::LockRejected);
    }

    #[test]
    fn scan_respects_bounds_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let sm = machine(dir.path());
        for (i, key) in ["a", "b", "c", "y", "z"].iter().enumerate() {
            sm.apply(i as i64, &LogEntry::new(LogOp::Put, "", *key, key.to_uppercase(), 1))
                .unwrap();
        }
        let (items, more) = sm.scan("", "b", "z", 10).unwrap();
        let keys: Vec<&str> = items.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["b", "c", "y"]);
        assert!(!more);

        let (items, more) = sm.scan("", "b", "z", 2).unwrap();
        assert_eq!(items.len(), 2);
        assert!(more);
    }
}
