//! Applied-state store.
//!
//! One redb file holds every namespace as its own table; the anonymous
//! namespace `""` maps to `@db`, named ones to `user/<name>`. Two internal
//! tables ride along:
//!
//! - `@applied` with the index of the last applied log entry
//! - `@sessions` with each live session and the lock keys it holds
//!
//! [`StorageManager::apply_batch`] commits a mutation together with its log
//! index, so a restarted node resumes exactly after the last entry it applied.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};

use crate::command::NO_INDEX;

const APPLIED: TableDefinition<&str, &[u8]> = TableDefinition::new("@applied");
const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("@sessions");
const LAST_APPLIED: &str = "last_applied";
const ITER_PAGE: usize = 128;

/// Lock keys held by a session, as `(namespace, key)` pairs.
pub type HeldKeys = Vec<(String, String)>;

fn table_name(ns: &str) -> String {
    if ns.is_empty() {
        "@db".to_string()
    } else {
        format!("user/{ns}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchOp {
    Put { ns: String, key: String, value: Vec<u8> },
    Delete { ns: String, key: String },
    PutSession { session: String, held: HeldKeys },
    DeleteSession { session: String },
}

/// Mutations committed atomically by [`StorageManager::apply_batch`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, ns: &str, key: &str, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            ns: ns.to_string(),
            key: key.to_string(),
            value,
        });
    }

    pub fn delete(&mut self, ns: &str, key: &str) {
        self.ops.push(BatchOp::Delete {
            ns: ns.to_string(),
            key: key.to_string(),
        });
    }

    pub fn put_session(&mut self, session: &str, held: HeldKeys) {
        self.ops.push(BatchOp::PutSession {
            session: session.to_string(),
            held,
        });
    }

    pub fn delete_session(&mut self, session: &str) {
        self.ops.push(BatchOp::DeleteSession {
            session: session.to_string(),
        });
    }

}

pub struct StorageManager {
    db: Arc<Database>,
    last_applied: AtomicI64,
}

impl StorageManager {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        let path = dir.join("store.redb");
        let db = Database::create(&path)
            .with_context(|| format!("failed to open store {}", path.display()))?;

        let txn = db.begin_write()?;
        txn.open_table(APPLIED)?;
        txn.open_table(SESSIONS)?;
        txn.commit()?;

        let last_applied = {
            let txn = db.begin_read()?;
            let table = txn.open_table(APPLIED)?;
            match table.get(LAST_APPLIED)? {
                Some(raw) => i64::from_le_bytes(
                    raw.value().try_into().context("corrupted last_applied")?,
                ),
                None => NO_INDEX,
            }
        };

        Ok(Self {
            db: Arc::new(db),
            last_applied: AtomicI64::new(last_applied),
        })
    }

    pub fn last_applied(&self) -> i64 {
        self.last_applied.load(Ordering::Acquire)
    }

    pub fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let name = table_name(ns);
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&name);
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(table.get(key)?.map(|raw| raw.value().to_vec()))
    }

    /// Writes a single value outside of log application.
    pub fn put(&self, ns: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(ns, key, value.to_vec());
        self.write(&batch, None)
    }

    /// Removes a single value outside of log application. Returns whether it existed.
    pub fn delete(&self, ns: &str, key: &str) -> Result<bool> {
        let existed = self.get(ns, key)?.is_some();
        if existed {
            let mut batch = WriteBatch::default();
            batch.delete(ns, key);
            self.write(&batch, None)?;
        }
        Ok(existed)
    }

    /// Commits `batch` and records `index` as the last applied entry.
    pub fn apply_batch(&self, index: i64, batch: &WriteBatch) -> Result<()> {
        self.write(batch, Some(index))
    }

    fn write(&self, batch: &WriteBatch, applied: Option<i64>) -> Result<()> {
        let txn = self.db.begin_write()?;
        for op in &batch.ops {
            match op {
                BatchOp::Put { ns, key, value } => {
                    let name = table_name(ns);
                    let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&name);
                    let mut table = txn.open_table(def)?;
                    table.insert(key.as_str(), value.as_slice())?;
                }
                BatchOp::Delete { ns, key } => {
                    let name = table_name(ns);
                    let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&name);
                    let mut table = txn.open_table(def)?;
                    table.remove(key.as_str())?;
                }
                BatchOp::PutSession { session, held } => {
                    let mut table = txn.open_table(SESSIONS)?;
                    table.insert(session.as_str(), bincode::serialize(held)?.as_slice())?;
                }
                BatchOp::DeleteSession { session } => {
                    let mut table = txn.open_table(SESSIONS)?;
                    table.remove(session.as_str())?;
                }
            }
        }
        if let Some(index) = applied {
            let mut table = txn.open_table(APPLIED)?;
            table.insert(LAST_APPLIED, index.to_le_bytes().as_slice())?;
        }
        txn.commit().context("failed to commit applied state")?;
        if let Some(index) = applied {
            self.last_applied.store(index, Ordering::Release);
        }
        Ok(())
    }

    /// Every persisted session with the lock keys it holds.
    pub fn sessions(&self) -> Result<Vec<(String, HeldKeys)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SESSIONS)?;
        let mut sessions = Vec::new();
        for row in table.iter()? {
            let (session, held) = row?;
            let held: HeldKeys =
                bincode::deserialize(held.value()).context("corrupted session record")?;
            sessions.push((session.value().to_string(), held));
        }
        Ok(sessions)
    }

    #[cfg(test)]
    pub fn session_keys(&self, session: &str) -> Result<Option<HeldKeys>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SESSIONS)?;
        match table.get(session)? {
            Some(raw) => Ok(Some(
                bincode::deserialize(raw.value()).context("corrupted session record")?,
            )),
            None => Ok(None),
        }
    }

    /// Ordered iterator over one namespace. Call [`StorageIterator::seek`] first.
    pub fn iter(&self, ns: &str) -> StorageIterator {
        StorageIterator {
            db: Arc::clone(&self.db),
            table: table_name(ns),
            page: VecDeque::new(),
            exhausted: true,
        }
    }
}

/// Lazily paged cursor over a namespace.
///
/// Each page is read from a fresh read transaction, so a long scan never
/// pins an old snapshot of the store.
pub struct StorageIterator {
    db: Arc<Database>,
    table: String,
    page: VecDeque<(String, Vec<u8>)>,
    exhausted: bool,
}

impl StorageIterator {
    /// Positions the cursor at the first key `>= key`.
    pub fn seek(&mut self, key: &str) -> Result<()> {
        self.page.clear();
        self.exhausted = false;
        self.fill(key)
    }

    pub fn valid(&self) -> bool {
        !self.page.is_empty()
    }

    /// Current key, empty when the cursor is not valid.
    pub fn key(&self) -> &str {
        self.page.front().map(|(key, _)| key.as_str()).unwrap_or_default()
    }

    pub fn value(&self) -> &[u8] {
        self.page
            .front()
            .map(|(_, value)| value.as_slice())
            .unwrap_or_default()
    }

    pub fn next(&mut self) -> Result<()> {
        let Some((last, _)) = self.page.pop_front() else {
            return Ok(());
        };
        if self.page.is_empty() && !self.exhausted {
            let mut from = last;
            from.push('\0');
            self.fill(&from)?;
        }
        Ok(())
    }

    fn fill(&mut self, from: &str) -> Result<()> {
        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&self.table);
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                self.exhausted = true;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        for row in table.range(from..)?.take(ITER_PAGE) {
            let (key, value) = row?;
            self.page
                .push_back((key.value().to_string(), value.value().to_vec()));
        }
        self.exhausted = self.page.len() < ITER_PAGE;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(iter: &mut StorageIterator) -> Vec<String> {
        let mut out = Vec::new();
        while iter.valid() {
            out.push(iter.key().to_string());
            iter.next().unwrap();
        }
        out
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = StorageManager::open(dir.path()).unwrap();
        store.put("", "k", b"anon").unwrap();
        store.put("alice", "k", b"alice").unwrap();

        assert_eq!(store.get("", "k").unwrap().as_deref(), Some(&b"anon"[..]));
        assert_eq!(store.get("alice", "k").unwrap().as_deref(), Some(&b"alice"[..]));
        assert_eq!(store.get("bob", "k").unwrap(), None);
        assert!(store.delete("alice", "k").unwrap());
        assert!(!store.delete("alice", "k").unwrap());
    }

    #[test]
    fn apply_batch_persists_last_applied() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StorageManager::open(dir.path()).unwrap();
            assert_eq!(store.last_applied(), NO_INDEX);
            let mut batch = WriteBatch::default();
            batch.put("", "a", b"1".to_vec());
            batch.put_session("s1", vec![("".into(), "lock".into())]);
            store.apply_batch(4, &batch).unwrap();
            store.apply_batch(5, &WriteBatch::default()).unwrap();
        }
        let store = StorageManager::open(dir.path()).unwrap();
        assert_eq!(store.last_applied(), 5);
        assert_eq!(store.get("", "a").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(
            store.session_keys("s1").unwrap(),
            Some(vec![("".to_string(), "lock".to_string())])
        );
        assert_eq!(store.sessions().unwrap().len(), 1);
    }

    #[test]
    fn iterator_walks_keys_in_order_across_pages() {
        let dir = tempfile::tempdir().unwrap();
        let store = StorageManager::open(dir.path()).unwrap();
        let mut batch = WriteBatch::default();
        for i in 0..300 {
            batch.put("", &format!("key{i:04}"), Vec::new());
        }
        store.apply_batch(0, &batch).unwrap();

        let mut iter = store.iter("");
        iter.seek("key0100").unwrap();
        let seen = keys(&mut iter);
        assert_eq!(seen.len(), 200);
        assert_eq!(seen.first().map(String::as_str), Some("key0100"));
        assert_eq!(seen.last().map(String::as_str), Some("key0299"));
    }

    #[test]
    fn iterator_over_missing_namespace_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StorageManager::open(dir.path()).unwrap();
        let mut iter = store.iter("nobody");
        iter.seek("").unwrap();
        assert!(!iter.valid());
        assert_eq!(iter.key(), "");
    }
}
