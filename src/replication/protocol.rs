//! Sync Wire Protocol
//!
//! The controller schedules full-sync, incremental-check and push jobs; the
//! wire bodies of those jobs sit behind [`SyncProtocol`] so the scheduling
//! contract stays independent of the transport. [`TcpSyncProtocol`] is the
//! line-and-frame implementation spoken over [`BlockingClient`]: commands
//! are single lines, bulk payloads are crc-checked bincode frames, and
//! replies follow Redis conventions (`+...` success, `-...` error).

use std::time::Duration;

use crate::error::{Error, Result};
use crate::network::BlockingClient;
use crate::store::{BinlogId, Store};

use super::meta::StoreMeta;
use super::rate_limiter::RateLimiter;

/// How long to wait for a command reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for a snapshot frame
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Most records shipped by one push job
const MAX_PUSH_BATCH: usize = 1000;

/// Wire bodies of the replication jobs the controller schedules
pub trait SyncProtocol: Send + Sync {
    /// Pull a full snapshot from the configured source into `store`;
    /// returns the binlog id the snapshot is anchored at
    fn full_sync(
        &self,
        store: &dyn Store,
        meta: &StoreMeta,
        client: &mut BlockingClient,
    ) -> Result<BinlogId>;

    /// Announce this store as an incremental subscriber of its source
    fn start_incr_sync(
        &self,
        store: &dyn Store,
        meta: &StoreMeta,
        client: &mut BlockingClient,
    ) -> Result<()>;

    /// Verify the incremental session is alive
    fn check_incr_sync(
        &self,
        store: &dyn Store,
        meta: &StoreMeta,
        client: &mut BlockingClient,
    ) -> Result<()>;

    /// Stream binlog records after `from` to a subscriber; returns the
    /// highest binlog id the subscriber acknowledged
    fn push_binlogs(
        &self,
        store: &dyn Store,
        client: &mut BlockingClient,
        from: BinlogId,
        limiter: &RateLimiter,
    ) -> Result<BinlogId>;
}

/// Line-and-frame protocol over a blocking TCP client
pub struct TcpSyncProtocol;

impl SyncProtocol for TcpSyncProtocol {
    fn full_sync(
        &self,
        store: &dyn Store,
        meta: &StoreMeta,
        client: &mut BlockingClient,
    ) -> Result<BinlogId> {
        client.write_line(&format!("FULLSYNC {} {}", meta.sync_from_id, meta.id))?;
        let reply = client.read_line(REPLY_TIMEOUT)?;
        if !reply.starts_with("+FULLSYNC") {
            return Err(Error::Network(format!("full sync refused: {}", reply)));
        }

        let blob = client.read_frame(TRANSFER_TIMEOUT)?;
        let anchor = store.import_snapshot(&mut &blob[..])?;
        client.write_line(&format!("+OK {}", anchor))?;
        Ok(anchor)
    }

    fn start_incr_sync(
        &self,
        _store: &dyn Store,
        meta: &StoreMeta,
        client: &mut BlockingClient,
    ) -> Result<()> {
        client.write_line(&format!(
            "INCRSYNC {} {} {}",
            meta.sync_from_id, meta.id, meta.binlog_id
        ))?;
        let reply = client.read_line(REPLY_TIMEOUT)?;
        if !reply.starts_with("+OK") {
            return Err(Error::Network(format!("incr sync refused: {}", reply)));
        }
        Ok(())
    }

    fn check_incr_sync(
        &self,
        _store: &dyn Store,
        _meta: &StoreMeta,
        client: &mut BlockingClient,
    ) -> Result<()> {
        client.write_line("PING")?;
        let reply = client.read_line(REPLY_TIMEOUT)?;
        if !reply.starts_with("+PONG") {
            return Err(Error::Network(format!("unexpected ping reply: {}", reply)));
        }
        Ok(())
    }

    fn push_binlogs(
        &self,
        store: &dyn Store,
        client: &mut BlockingClient,
        from: BinlogId,
        limiter: &RateLimiter,
    ) -> Result<BinlogId> {
        let records = store.binlogs_since(from, MAX_PUSH_BATCH)?;
        if records.is_empty() {
            return Ok(from);
        }

        let mut frames = Vec::with_capacity(records.len());
        let mut total = 0u64;
        for record in &records {
            let bytes = bincode::serialize(record)?;
            total += bytes.len() as u64 + 8;
            frames.push(bytes);
        }
        limiter.consume(total);

        client.write_line(&format!("BINLOGS {}", frames.len()))?;
        for frame in &frames {
            client.write_frame(frame)?;
        }

        let reply = client.read_line(REPLY_TIMEOUT)?;
        let acked = reply
            .strip_prefix("+OK ")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::Network(format!("unexpected push reply: {}", reply)))?;
        if acked < from {
            return Err(Error::Network(format!(
                "acknowledged position {} went backwards from {}",
                acked, from
            )));
        }
        Ok(acked)
    }
}
