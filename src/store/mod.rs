//! Storage Engine Interface
//!
//! WolfCache partitions data into a fixed number of independent stores, each
//! with its own write-ahead binlog. This module defines the engine-facing
//! traits the replication manager drives, the binlog record type, and the
//! archive frame format shared by binlog dumps and snapshot transfer.

use std::io::{Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod memory;
pub mod segment;

pub use memory::MemStore;
pub use segment::{LockMode, SegmentManager, StoreHandle};

/// Binlog record sequence number
pub type BinlogId = u64;

/// Sentinel for an unset binlog id
pub const TXNID_UNINITED: BinlogId = u64::MAX;

/// Smallest binlog id a record may carry
pub const MIN_VALID_TXNID: BinlogId = 1;

/// One durable write in a store's binlog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogRecord {
    /// Monotonically increasing record id
    pub id: BinlogId,
    /// Wall-clock timestamp of the write in milliseconds
    pub timestamp_ms: u64,
    /// Engine-encoded operation payload
    pub payload: Vec<u8>,
}

/// Runtime mode of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Accepts client writes; this store is a master
    ReadWrite,
    /// Accepts only replicated writes; this store is a slave
    ReplicateOnly,
}

/// Outcome of one binlog truncation pass
#[derive(Debug, Clone, Copy)]
pub struct TruncateResult {
    /// Smallest binlog id retained after the pass
    pub new_start: BinlogId,
    /// Bytes written to the archive sink, 0 when no sink was given
    pub written: u64,
    /// Timestamp of the newest truncated record, 0 when none were truncated
    pub timestamp: u64,
}

/// A single storage shard
pub trait Store: Send + Sync {
    /// Shard index on this node
    fn id(&self) -> u32;

    /// Whether the store has been opened
    fn is_open(&self) -> bool;

    /// Whether the store is currently serving requests
    fn is_running(&self) -> bool;

    /// Whether the store holds no data
    fn is_empty(&self) -> Result<bool>;

    /// Current runtime mode
    fn mode(&self) -> StoreMode;

    /// Switch runtime mode; callers hold an exclusive store lock
    fn set_mode(&self, mode: StoreMode) -> Result<()>;

    /// Highest binlog id ever assigned, 0 when nothing was written
    fn highest_binlog_id(&self) -> Result<BinlogId>;

    /// Oldest retained binlog record, `Error::Exhaust` when the binlog is empty
    fn min_binlog(&self) -> Result<BinlogRecord>;

    /// Retained records with id strictly greater than `from`, oldest first
    fn binlogs_since(&self, from: BinlogId, limit: usize) -> Result<Vec<BinlogRecord>>;

    /// Apply a record replicated from a master
    fn apply_binlog(&self, record: &BinlogRecord) -> Result<()>;

    /// Write a point-in-time snapshot; returns the binlog id it is anchored at
    fn export_snapshot(&self, w: &mut dyn Write) -> Result<BinlogId>;

    /// Replace store content with a snapshot; returns its binlog anchor
    fn import_snapshot(&self, r: &mut dyn Read) -> Result<BinlogId>;

    /// Begin a transaction for binlog truncation
    fn create_transaction(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// Transaction scope for binlog truncation
pub trait StoreTransaction: Send {
    /// Stage removal of records in `[start, end)`, framing each into `sink`
    /// before it is dropped. `start == TXNID_UNINITED` means recompute the
    /// lower bound from the smallest retained record.
    fn truncate_binlog(
        &mut self,
        start: BinlogId,
        end: BinlogId,
        sink: Option<&mut dyn Write>,
    ) -> Result<TruncateResult>;

    /// Make staged changes durable
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard staged changes
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Shared handle to a store
pub type SharedStore = Arc<dyn Store>;

/// Frame one binlog record into an archive or wire sink.
///
/// Layout: `[len: u32 le][crc32: u32 le][bincode bytes]`. Returns the frame
/// size in bytes.
pub fn write_record_frame(w: &mut dyn Write, record: &BinlogRecord) -> Result<u64> {
    let bytes = bincode::serialize(record)?;
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(&crc32fast::hash(&bytes).to_le_bytes())?;
    w.write_all(&bytes)?;
    Ok(8 + bytes.len() as u64)
}

/// Read one framed binlog record; `None` at a clean end of stream.
pub fn read_record_frame(r: &mut dyn Read) -> Result<Option<BinlogRecord>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(r, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut crc_buf = [0u8; 4];
    r.read_exact(&mut crc_buf)?;
    let expected = u32::from_le_bytes(crc_buf);

    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    if crc32fast::hash(&bytes) != expected {
        return Err(Error::Internal("archive frame checksum mismatch".into()));
    }
    Ok(Some(bincode::deserialize(&bytes)?))
}

/// Fill `buf` completely, or report a clean EOF before the first byte.
fn read_or_eof(r: &mut dyn Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::Internal("truncated archive frame".into()));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: BinlogId) -> BinlogRecord {
        BinlogRecord {
            id,
            timestamp_ms: 1000 + id,
            payload: vec![0xAB; 16],
        }
    }

    #[test]
    fn test_record_frame_roundtrip() {
        let mut buf = Vec::new();
        let n1 = write_record_frame(&mut buf, &record(1)).unwrap();
        let n2 = write_record_frame(&mut buf, &record(2)).unwrap();
        assert_eq!(buf.len() as u64, n1 + n2);

        let mut cursor = &buf[..];
        let r1 = read_record_frame(&mut cursor).unwrap().unwrap();
        let r2 = read_record_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(r1.id, 1);
        assert_eq!(r2.id, 2);
        assert!(read_record_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        let mut buf = Vec::new();
        write_record_frame(&mut buf, &record(7)).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let mut cursor = &buf[..];
        assert!(read_record_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut buf = Vec::new();
        write_record_frame(&mut buf, &record(7)).unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = &buf[..];
        assert!(read_record_frame(&mut cursor).is_err());
    }
}
