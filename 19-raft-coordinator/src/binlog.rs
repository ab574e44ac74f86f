//! Durable, index-addressed replicated log.
//!
//! Slots live in a single redb table keyed by the little-endian slot index.
//! Two reserved keys sit next to them:
//!
//! - `#BINLOG_LEN#` holds the exclusive upper bound of the log
//! - `#BINLOG_START#` holds the first retained index and the term of the
//!   slot right before it, so a cleaned prefix can still answer log-matching
//!   checks
//!
//! Every mutation (batch append, truncate, prefix removal) commits the slots
//! and the markers in one write transaction, so the stored length can never
//! disagree with the stored slots after a crash.

use std::path::Path;

use anyhow::{Context, Result, bail};
use redb::{Database, ReadableDatabase, TableDefinition};
use tracing::{debug, info};

use crate::command::{LogEntry, NO_INDEX, NO_TERM};

const SLOTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("binlog");
const LENGTH_TAG: &[u8] = b"#BINLOG_LEN#";
const START_TAG: &[u8] = b"#BINLOG_START#";

pub struct BinLog {
    db: Database,
    length: i64,
    start: i64,
    start_term: i64,
    last_log_term: i64,
}

impl BinLog {
    /// Opens (or creates) the log stored under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create binlog dir {}", dir.display()))?;
        let path = dir.join("binlog.redb");
        let db = Database::create(&path)
            .with_context(|| format!("failed to open binlog {}", path.display()))?;

        let txn = db.begin_write()?;
        txn.open_table(SLOTS)?;
        txn.commit()?;

        let mut log = Self {
            db,
            length: 0,
            start: 0,
            start_term: NO_TERM,
            last_log_term: NO_TERM,
        };
        log.load_markers()?;
        info!(
            length = log.length,
            start = log.start,
            last_log_term = log.last_log_term,
            "binlog opened"
        );
        Ok(log)
    }

    fn load_markers(&mut self) -> Result<()> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SLOTS)?;
        if let Some(raw) = table.get(LENGTH_TAG)? {
            self.length = decode_i64(raw.value()).context("corrupted binlog length")?;
        }
        if let Some(raw) = table.get(START_TAG)? {
            let raw = raw.value();
            if raw.len() != 16 {
                bail!("corrupted binlog start marker");
            }
            self.start = decode_i64(&raw[..8])?;
            self.start_term = decode_i64(&raw[8..])?;
        }
        drop(table);
        self.last_log_term = self.term_at(self.length - 1)?;
        Ok(())
    }

    /// Exclusive upper bound of the log.
    pub fn len(&self) -> i64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// First index still stored; everything below was removed by [`BinLog::remove_prefix`].
    pub fn first_index(&self) -> i64 {
        self.start
    }

    pub fn last_log_term(&self) -> i64 {
        self.last_log_term
    }

    pub fn last_index_and_term(&self) -> (i64, i64) {
        (self.length - 1, self.last_log_term)
    }

    /// Appends one entry and returns its index.
    pub fn append(&mut self, entry: &LogEntry) -> Result<i64> {
        let index = self.length;
        self.append_batch(std::slice::from_ref(entry))?;
        Ok(index)
    }

    /// Appends a batch and the new length marker atomically. Returns the new length.
    pub fn append_batch(&mut self, entries: &[LogEntry]) -> Result<i64> {
        let Some(last) = entries.last() else {
            return Ok(self.length);
        };
        let new_length = self.length + entries.len() as i64;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SLOTS)?;
            for (offset, entry) in entries.iter().enumerate() {
                let key = slot_key(self.length + offset as i64);
                table.insert(key.as_slice(), entry.dump().as_slice())?;
            }
            table.insert(LENGTH_TAG, new_length.to_le_bytes().as_slice())?;
        }
        txn.commit().context("failed to commit binlog append")?;
        self.length = new_length;
        self.last_log_term = last.term;
        Ok(new_length)
    }

    /// Reads slot `index`. Returns `None` at or past the end of the log.
    pub fn read(&self, index: i64) -> Result<Option<LogEntry>> {
        if index >= self.length {
            return Ok(None);
        }
        if index < self.start {
            bail!("slot {index} was removed (log starts at {})", self.start);
        }
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SLOTS)?;
        let raw = table
            .get(slot_key(index).as_slice())?
            .with_context(|| format!("slot {index} missing below length {}", self.length))?;
        let entry = LogEntry::load(raw.value())
            .with_context(|| format!("slot {index} is corrupted"))?;
        Ok(Some(entry))
    }

    /// Reads up to `max` consecutive entries starting at `from`.
    pub fn read_range(&self, from: i64, max: usize) -> Result<Vec<LogEntry>> {
        let end = self.length.min(from.saturating_add(max as i64));
        if from >= end {
            return Ok(Vec::new());
        }
        if from < self.start {
            bail!("slot {from} was removed (log starts at {})", self.start);
        }
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SLOTS)?;
        let mut entries = Vec::with_capacity((end - from) as usize);
        for index in from..end {
            let raw = table
                .get(slot_key(index).as_slice())?
                .with_context(|| format!("slot {index} missing below length {}", self.length))?;
            entries.push(LogEntry::load(raw.value())?);
        }
        Ok(entries)
    }

    /// Term of slot `index`; [`NO_TERM`] for [`NO_INDEX`].
    ///
    /// The slot right before a removed prefix still answers with the term
    /// recorded when the prefix was removed.
    pub fn term_at(&self, index: i64) -> Result<i64> {
        if index == NO_INDEX {
            return Ok(NO_TERM);
        }
        if index == self.start - 1 {
            return Ok(self.start_term);
        }
        match self.read(index)? {
            Some(entry) => Ok(entry.term),
            None => bail!("slot {index} is past the end of the log ({})", self.length),
        }
    }

    /// Discards every slot above `index`; the new length is `index + 1`.
    pub fn truncate(&mut self, index: i64) -> Result<()> {
        let index = index.max(NO_INDEX);
        if index + 1 >= self.length {
            return Ok(());
        }
        if index + 1 < self.start {
            bail!("cannot truncate to {index}, log starts at {}", self.start);
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SLOTS)?;
            for slot in index + 1..self.length {
                table.remove(slot_key(slot).as_slice())?;
            }
            table.insert(LENGTH_TAG, (index + 1).to_le_bytes().as_slice())?;
        }
        txn.commit().context("failed to commit binlog truncate")?;
        debug!(from = self.length, to = index + 1, "binlog truncated");
        self.length = index + 1;
        self.last_log_term = self.term_at(index)?;
        Ok(())
    }

    /// Removes every slot below `end_index`.
    ///
    /// The caller guarantees those slots are already applied.
    pub fn remove_prefix(&mut self, end_index: i64) -> Result<()> {
        if end_index <= self.start {
            return Ok(());
        }
        if end_index > self.length {
            bail!("cannot clean to {end_index}, log length is {}", self.length);
        }
        let boundary_term = self.term_at(end_index - 1)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SLOTS)?;
            for slot in self.start..end_index {
                table.remove(slot_key(slot).as_slice())?;
            }
            let mut marker = Vec::with_capacity(16);
            marker.extend_from_slice(&end_index.to_le_bytes());
            marker.extend_from_slice(&boundary_term.to_le_bytes());
            table.insert(START_TAG, marker.as_slice())?;
        }
        txn.commit().context("failed to commit binlog clean")?;
        info!(from = self.start, to = end_index, "binlog prefix removed");
        self.start = end_index;
        self.start_term = boundary_term;
        Ok(())
    }
}

fn slot_key(index: i64) -> [u8; 8] {
    index.to_le_bytes()
}

fn decode_i64(raw: &[u8]) -> Result<i64> {
    Ok(i64::from_le_bytes(raw.try_into()?))
}
