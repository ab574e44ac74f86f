//! In-memory session table.
//!
//! Every replica rebuilds the same set of sessions from committed
//! `KeepAlive`, `Lock`, `UnLock` and `ReleaseSession` entries; only the
//! liveness timestamps are local. The leader turns stale timestamps into
//! committed `ReleaseSession` entries, so replicas agree on *when* a
//! session's locks go away even though their clocks differ.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::storage::HeldKeys;

#[derive(Debug, Clone)]
struct SessionEntry {
    last_alive: Instant,
    held: HeldKeys,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, SessionEntry>,
}

impl SessionTable {
    /// Rebuilds the table from persisted sessions, treating all of them as
    /// alive right now.
    pub fn restore(rows: Vec<(String, HeldKeys)>, now: Instant) -> Self {
        let sessions = rows
            .into_iter()
            .map(|(id, held)| (id, SessionEntry { last_alive: now, held }))
            .collect();
        Self { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Refreshes `id`, creating it if needed. Returns `true` for a new session.
    pub fn touch(&mut self, id: &str, now: Instant) -> bool {
        match self.sessions.get_mut(id) {
            Some(entry) => {
                entry.last_alive = now;
                false
            }
            None => {
                self.sessions.insert(
                    id.to_string(),
                    SessionEntry {
                        last_alive: now,
                        held: Vec::new(),
                    },
                );
                true
            }
        }
    }

    /// Records that `id` holds `(ns, key)` and returns the updated list.
    pub fn add_key(&mut self, id: &str, ns: &str, key: &str, now: Instant) -> HeldKeys {
        self.touch(id, now);
        let held = match self.sessions.get_mut(id) {
            Some(entry) => &mut entry.held,
            None => return Vec::new(),
        };
        if !held.iter().any(|(n, k)| n == ns && k == key) {
            held.push((ns.to_string(), key.to_string()));
        }
        held.clone()
    }

    /// Forgets `(ns, key)` for `id`, returning the updated list when the session exists.
    pub fn remove_key(&mut self, id: &str, ns: &str, key: &str) -> Option<HeldKeys> {
        let entry = self.sessions.get_mut(id)?;
        entry.held.retain(|(n, k)| !(n == ns && k == key));
        Some(entry.held.clone())
    }

    /// Drops the session and returns the keys it held.
    pub fn remove(&mut self, id: &str) -> Option<HeldKeys> {
        self.sessions.remove(id).map(|entry| entry.held)
    }

    pub fn is_live(&self, id: &str, now: Instant, timeout: Duration) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|entry| now.saturating_duration_since(entry.last_alive) <= timeout)
    }

    /// Sessions whose last keepalive is older than `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_alive) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Gives every session a fresh lease; a new leader has no idea how long
    /// the old one had been waiting on them.
    pub fn reset_all(&mut self, now: Instant) {
        for entry in self.sessions.values_mut() {
            entry.last_alive = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(6);

    #[test]
    fn touch_creates_then_refreshes() {
        let now = Instant::now();
        let mut table = SessionTable::default();
        assert!(table.touch("s1", now));
        assert!(!table.touch("s1", now + Duration::from_secs(5)));
        assert_eq!(table.len(), 1);
        assert!(table.is_live("s1", now + Duration::from_secs(10), TIMEOUT));
    }

    #[test]
    fn expired_lists_only_stale_sessions() {
        let now = Instant::now();
        let mut table = SessionTable::default();
        table.touch("old", now);
        table.touch("fresh", now + Duration::from_secs(5));

        let later = now + Duration::from_secs(7);
        assert_eq!(table.expired(later, TIMEOUT), vec!["old".to_string()]);
        assert!(!table.is_live("old", later, TIMEOUT));
        assert!(!table.is_live("missing", later, TIMEOUT));

        table.reset_all(later);
        assert!(table.expired(later, TIMEOUT).is_empty());
    }

    #[test]
    fn held_keys_follow_lock_and_unlock() {
        let now = Instant::now();
        let mut table = SessionTable::default();
        table.add_key("s1", "", "a", now);
        let held = table.add_key("s1", "", "b", now);
        assert_eq!(held.len(), 2);
        assert_eq!(table.add_key("s1", "", "a", now).len(), 2);

        let held = table.remove_key("s1", "", "a").unwrap();
        assert_eq!(held, vec![("".to_string(), "b".to_string())]);
        assert_eq!(table.remove_key("ghost", "", "a"), None);

        assert_eq!(table.remove("s1").unwrap().len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn restore_marks_everything_alive() {
        let now = Instant::now();
        let table = SessionTable::restore(vec![("s1".into(), vec![("".into(), "k".into())])], now);
        assert!(table.contains("s1"));
        assert_eq!(table.sessions.get("s1").map(|entry| entry.held.len()), Some(1));
        assert!(table.is_live("s1", now, TIMEOUT));
    }
}
