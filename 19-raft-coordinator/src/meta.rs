//! Durable `current_term` and `voted_for` record.
//!
//! A node must never forget a term it has seen or vote twice in one term,
//! even across restarts, so both values are committed to disk before the
//! node answers any RPC that depends on them.

use std::path::Path;

use anyhow::{Context, Result};
use redb::{Database, ReadableDatabase, TableDefinition};
use serde::{Deserialize, Serialize};

const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const CURRENT_TERM: &str = "current_term";
const VOTED_FOR: &str = "voted_for";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VoteRecord {
    term: i64,
    candidate: String,
}

pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create meta dir {}", dir.display()))?;
        let path = dir.join("meta.redb");
        let db = Database::create(&path)
            .with_context(|| format!("failed to open meta store {}", path.display()))?;
        let txn = db.begin_write()?;
        txn.open_table(META)?;
        txn.commit()?;
        Ok(Self { db })
    }

    /// Last persisted term, `0` for a fresh node.
    pub fn current_term(&self) -> Result<i64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        match table.get(CURRENT_TERM)? {
            Some(raw) => Ok(i64::from_le_bytes(
                raw.value().try_into().context("corrupted current_term")?,
            )),
            None => Ok(0),
        }
    }

    /// Candidate this node voted for in `term`, if any.
    pub fn voted_for(&self, term: i64) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        let Some(raw) = table.get(VOTED_FOR)? else {
            return Ok(None);
        };
        let record: VoteRecord =
            bincode::deserialize(raw.value()).context("corrupted vote record")?;
        Ok((record.term == term).then_some(record.candidate))
    }

    pub fn set_current_term(&self, term: i64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META)?;
            table.insert(CURRENT_TERM, term.to_le_bytes().as_slice())?;
        }
        txn.commit().context("failed to persist current_term")
    }

    /// Records a vote together with the term it was cast in.
    pub fn set_voted_for(&self, term: i64, candidate: &str) -> Result<()> {
        let record = bincode::serialize(&VoteRecord {
            term,
            candidate: candidate.to_string(),
        })?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META)?;
            table.insert(CURRENT_TERM, term.to_le_bytes().as_slice())?;
            table.insert(VOTED_FOR, record.as_slice())?;
        }
        txn.commit().context("failed to persist vote")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_starts_at_term_zero() {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaStore::open(dir.path()).unwrap();
        assert_eq!(meta.current_term().unwrap(), 0);
        assert_eq!(meta.voted_for(0).unwrap(), None);
    }

    #[test]
    fn vote_is_scoped_to_its_term() {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaStore::open(dir.path()).unwrap();
        meta.set_voted_for(3, "n1").unwrap();
        assert_eq!(meta.current_term().unwrap(), 3);
        assert_eq!(meta.voted_for(3).unwrap().as_deref(), Some("n1"));
        assert_eq!(meta.voted_for(4).unwrap(), None);
    }

    #[test]
    fn term_and_vote_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let meta = MetaStore::open(dir.path()).unwrap();
            meta.set_voted_for(2, "n2").unwrap();
            meta.set_current_term(5).unwrap();
        }
        let meta = MetaStore::open(dir.path()).unwrap();
        assert_eq!(meta.current_term().unwrap(), 5);
        assert_eq!(meta.voted_for(2).unwrap().as_deref(), Some("n2"));
        assert_eq!(meta.voted_for(5).unwrap(), None);
    }
}
