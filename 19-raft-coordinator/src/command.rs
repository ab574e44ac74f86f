//! Operations that flow through the replicated log.
//!
//! Every client write (and a few internal bookkeeping operations) becomes a
//! [`LogEntry`]. Entries are immutable once appended and are stored in the
//! binlog using the fixed little-endian layout implemented by
//! [`LogEntry::dump`] and [`LogEntry::load`].

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

/// Index value meaning "no slot" (empty log, or the slot before index 0).
pub const NO_INDEX: i64 = -1;

/// Term reported for an empty log.
pub const NO_TERM: i64 = -1;

/// Operation carried by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogOp {
    Put = 1,
    Delete = 2,
    /// Appended by a freshly elected leader to commit prior-term entries.
    Nop = 3,
    Lock = 4,
    UnLock = 5,
    KeepAlive = 6,
    /// Drops a session and every lock it still holds.
    ReleaseSession = 7,
}

impl LogOp {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => LogOp::Put,
            2 => LogOp::Delete,
            3 => LogOp::Nop,
            4 => LogOp::Lock,
            5 => LogOp::UnLock,
            6 => LogOp::KeepAlive,
            7 => LogOp::ReleaseSession,
            other => bail!("unknown log opcode {other}"),
        })
    }
}

/// A single replicated operation.
///
/// `user` is the namespace the operation targets; the consensus layer never
/// interprets it beyond routing to the right partition of the applied state.
/// For lock operations `value` carries the session id, for session
/// operations `key` carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub op: LogOp,
    pub user: String,
    pub key: String,
    pub value: String,
    pub term: i64,
}

impl LogEntry {
    pub fn new(
        op: LogOp,
        user: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        term: i64,
    ) -> Self {
        Self {
            op,
            user: user.into(),
            key: key.into(),
            value: value.into(),
            term,
        }
    }

    pub fn nop(term: i64) -> Self {
        Self::new(LogOp::Nop, "", "Ping", "", term)
    }

    /// Serializes the entry as
    /// `[op:u8][len:u32][user][len:u32][key][len:u32][value][term:i64]`.
    pub fn dump(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            1 + 4 * 3 + self.user.len() + self.key.len() + self.value.len() + 8,
        );
        buf.push(self.op.as_byte());
        for field in [&self.user, &self.key, &self.value] {
            buf.extend_from_slice(&(field.len() as u32).to_le_bytes());
            buf.extend_from_slice(field.as_bytes());
        }
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf
    }

    /// Parses bytes produced by [`LogEntry::dump`].
    pub fn load(buf: &[u8]) -> Result<Self> {
        let mut reader = SlotReader { buf, pos: 0 };
        let op = LogOp::from_byte(reader.take(1)?[0])?;
        let user = reader.take_string()?;
        let key = reader.take_string()?;
        let value = reader.take_string()?;
        let term = i64::from_le_bytes(reader.take(8)?.try_into()?);
        if reader.pos != buf.len() {
            bail!("{} trailing bytes after log entry", buf.len() - reader.pos);
        }
        Ok(Self {
            op,
            user,
            key,
            value,
            term,
        })
    }
}

struct SlotReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SlotReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| anyhow!("log entry truncated at byte {}", self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_string(&mut self) -> Result<String> {
        let len = u32::from_le_bytes(self.take(4)?.try_into()?) as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_matches_fixed_layout() {
        let entry = LogEntry::new(LogOp::Lock, "ns", "k", "sess", 7);
        let buf = entry.dump();

        assert_eq!(buf[0], 4);
        assert_eq!(&buf[1..5], &2u32.to_le_bytes());
        assert_eq!(&buf[5..7], b"ns");
        assert_eq!(&buf[7..11], &1u32.to_le_bytes());
        assert_eq!(&buf[11..12], b"k");
        assert_eq!(&buf[12..16], &4u32.to_le_bytes());
        assert_eq!(&buf[16..20], b"sess");
        assert_eq!(&buf[20..28], &7i64.to_le_bytes());
        assert_eq!(buf.len(), 28);

        assert_eq!(LogEntry::load(&buf).unwrap(), entry);
    }

    #[test]
    fn empty_fields_survive_dump_and_load() {
        let entry = LogEntry::new(LogOp::Delete, "", "", "", 0);
        assert_eq!(LogEntry::load(&entry.dump()).unwrap(), entry);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let buf = LogEntry::new(LogOp::Put, "", "key", "value", 3).dump();
        assert!(LogEntry::load(&buf[..buf.len() - 1]).is_err());
        assert!(LogEntry::load(&[]).is_err());
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut buf = LogEntry::new(LogOp::Put, "", "a", "b", 1).dump();
        buf[0] = 42;
        assert!(LogEntry::load(&buf).is_err());
    }
}
