//! Binlog Recycling
//!
//! Reclaims binlog space per store once no live replication target still
//! needs the records, archiving what is reclaimed into rolling dump files.
//! Scheduling bookkeeping lives under the central mutex; the archive file
//! itself is guarded by a per-store mutex ordered after it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::store::{BinlogId, LockMode, MIN_VALID_TXNID, TXNID_UNINITED};

use super::manager::ReplManager;

/// Per-store archive bookkeeping, guarded by the store's recycle mutex
pub(super) struct ArchiveState {
    /// Sequence of the newest archive file; new files always use a
    /// strictly greater sequence
    pub(super) file_seq: u32,
    /// The archive file currently being appended to
    pub(super) cur_file: Option<ArchiveFile>,
}

impl ArchiveState {
    pub(super) fn new() -> Self {
        Self {
            file_seq: 0,
            cur_file: None,
        }
    }
}

/// An open archive file
pub(super) struct ArchiveFile {
    pub(super) writer: ArchiveWriter,
    path: PathBuf,
    written: u64,
    last_timestamp: u64,
}

impl ArchiveFile {
    fn finalize(self) -> Result<()> {
        let path = self.path;
        let file = match self.writer {
            ArchiveWriter::Plain(w) => w
                .into_inner()
                .map_err(|e| Error::Internal(format!("flushing {} failed: {}", path.display(), e)))?,
            ArchiveWriter::Lz4(encoder) => encoder
                .finish()
                .map_err(|e| Error::Internal(format!("finishing {} failed: {}", path.display(), e)))?
                .into_inner()
                .map_err(|e| Error::Internal(format!("flushing {} failed: {}", path.display(), e)))?,
        };
        file.sync_all()?;
        Ok(())
    }
}

/// Plain or LZ4-framed archive sink
pub(super) enum ArchiveWriter {
    Plain(BufWriter<File>),
    Lz4(lz4_flex::frame::FrameEncoder<BufWriter<File>>),
}

impl Write for ArchiveWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ArchiveWriter::Plain(w) => w.write(buf),
            ArchiveWriter::Lz4(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ArchiveWriter::Plain(w) => w.flush(),
            ArchiveWriter::Lz4(w) => w.flush(),
        }
    }
}

fn parse_file_seq(name: &str) -> Result<u32> {
    let field = name
        .split('-')
        .nth(2)
        .ok_or_else(|| Error::Internal(format!("unexpected archive file name: {}", name)))?;
    let seq: u64 = field
        .parse()
        .map_err(|_| Error::Internal(format!("invalid file sequence in {}", name)))?;
    if seq >= u32::MAX as u64 {
        return Err(Error::Internal(format!("invalid file sequence in {}", name)));
    }
    Ok(seq as u32)
}

impl ReplManager {
    /// Largest file sequence present in a store's dump directory, creating
    /// the directory tree on demand. 0 when no archive files exist.
    pub(super) fn max_dump_file_seq(&self, store_id: u32) -> Result<u32> {
        let sub = self.ensure_dump_dirs(store_id)?;

        let mut max_seq = 0u32;
        let mut pending = vec![sub];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if !file_type.is_file() {
                    debug!(path = %entry.path().display(), "ignoring non-regular file");
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !name.starts_with("binlog") {
                    info!(store = store_id, file = %name, "ignoring unexpected file in dump dir");
                    continue;
                }
                max_seq = max_seq.max(parse_file_seq(&name)?);
            }
        }
        Ok(max_seq)
    }

    fn ensure_dump_dirs(&self, store_id: u32) -> Result<PathBuf> {
        let root = self.cfg.dump_path.clone();
        let sub = root.join(store_id.to_string());
        for dir in [root.as_path(), sub.as_path()] {
            if !dir.exists() {
                std::fs::create_dir(dir).map_err(|e| {
                    error!(dir = %dir.display(), error = %e, "creating dump dir failed");
                    Error::Internal(format!("create dir {} failed: {}", dir.display(), e))
                })?;
            }
        }
        Ok(sub)
    }

    /// Open a fresh archive file if none is current
    pub(super) fn ensure_cur_binlog_fs(
        &self,
        store_id: u32,
        arch: &mut ArchiveState,
        first_binlog_id: BinlogId,
    ) -> Result<()> {
        if arch.cur_file.is_some() {
            return Ok(());
        }
        let seq = arch
            .file_seq
            .checked_add(1)
            .ok_or_else(|| Error::Internal("archive file sequence overflow".into()))?;
        let ext = if self.cfg.dump_compression {
            "log.lz4"
        } else {
            "log"
        };
        let name = format!("binlog-{}-{}-{}.{}", store_id, seq, first_binlog_id, ext);
        let path = self.ensure_dump_dirs(store_id)?.join(name);

        let file = BufWriter::new(File::create(&path)?);
        let writer = if self.cfg.dump_compression {
            ArchiveWriter::Lz4(lz4_flex::frame::FrameEncoder::new(file))
        } else {
            ArchiveWriter::Plain(file)
        };
        info!(store = store_id, path = %path.display(), "archive file opened");
        arch.file_seq = seq;
        arch.cur_file = Some(ArchiveFile {
            writer,
            path,
            written: 0,
            last_timestamp: 0,
        });
        Ok(())
    }

    /// Account archived bytes and finalize the file once the rotation
    /// threshold is crossed or `force` is set
    pub(super) fn update_cur_binlog_fs(
        &self,
        arch: &mut ArchiveState,
        written: u64,
        timestamp: u64,
        force: bool,
    ) -> Result<()> {
        if let Some(file) = arch.cur_file.as_mut() {
            file.written += written;
            if timestamp > 0 {
                file.last_timestamp = timestamp;
            }
        }
        let rotate = match arch.cur_file.as_ref() {
            Some(file) => force || file.written >= self.cfg.dump_file_size_bytes(),
            None => false,
        };
        if rotate {
            if let Some(file) = arch.cur_file.take() {
                let path = file.path.clone();
                let written = file.written;
                let last_timestamp = file.last_timestamp;
                file.finalize()?;
                info!(
                    path = %path.display(),
                    written,
                    last_timestamp,
                    "archive file finalized"
                );
            }
        }
        Ok(())
    }

    /// Finalize the archive file a store is appending to; called by the
    /// engine on flush
    pub fn flush_cur_binlog_fs(&self, store_id: u32) {
        let Some(mutex) = self.archives.get(store_id as usize) else {
            return;
        };
        let mut arch = mutex.lock();
        if let Err(e) = self.update_cur_binlog_fs(&mut arch, 0, 0, true) {
            warn!(store = store_id, error = %e, "flushing archive file failed");
        }
    }

    /// Forget the recycle floor after a flush-style operation dropped the
    /// binlog wholesale
    pub fn reset_recycle_state(&self, store_id: u32) {
        let mut st = self.state.lock();
        if let Some(status) = st.recycle.get_mut(store_id as usize) {
            status.first_binlog_id = MIN_VALID_TXNID;
            status.timestamp = 0;
            status.last_flush_binlog_id = TXNID_UNINITED;
        }
    }

    /// One recycle pass over a store. Scheduling state is restored on
    /// every exit path; a failed run resets the floor so the next run
    /// recomputes it from scratch.
    pub(super) fn recycle_binlog(&self, store_id: usize) {
        let jitter = rand::thread_rng().gen_range(0.80f64..1.20f64);
        let interval = (self.cfg.truncate_binlog_interval_ms as f64 * jitter) as u64;
        let mut next_sched = Instant::now() + Duration::from_millis(interval);
        let mut outcome: Option<(BinlogId, u64)> = None;

        let result = self.recycle_binlog_inner(store_id, &mut next_sched, &mut outcome);

        let mut st = self.state.lock();
        let status = &mut st.recycle[store_id];
        debug_assert!(status.is_running);
        status.is_running = false;
        status.next_sched_time.raise_to(next_sched);
        match result {
            Ok(()) => {
                if let Some((new_start, timestamp)) = outcome {
                    status.first_binlog_id = new_start;
                    if timestamp > 0 {
                        status.timestamp = timestamp;
                    }
                    debug!(store = store_id, first_binlog = new_start, "recycle floor advanced");
                }
            }
            Err(e) => {
                error!(store = store_id, error = %e, "binlog recycle failed");
                status.first_binlog_id = TXNID_UNINITED;
            }
        }
    }

    fn recycle_binlog_inner(
        &self,
        store_id: usize,
        next_sched: &mut Instant,
        outcome: &mut Option<(BinlogId, u64)>,
    ) -> Result<()> {
        let handle = self.seg_mgr.get_store(store_id as u32, LockMode::LockIx)?;
        let store = &handle.store;
        if !store.is_running() {
            warn!(store = store_id, "store is not running, recycle deferred");
            *next_sched = Instant::now() + Duration::from_secs(1);
            return Ok(());
        }

        let (save_logs, start, end) = {
            let st = self.state.lock();
            let meta = &st.sync_meta[store_id];
            // a slave always archives; a master archives too unless a live
            // subscriber already tails the stream
            let save_logs = meta.is_slave() || st.push_status[store_id].is_empty();
            let start = st.recycle[store_id].first_binlog_id;
            let mut end = u64::MAX;
            for status in st.full_push_status[store_id].values() {
                end = end.min(status.binlog_pos);
            }
            for status in st.push_status[store_id].values() {
                end = end.min(status.binlog_pos);
            }
            (save_logs, start, end)
        };

        let mut txn = store.create_transaction()?;
        let result = {
            let mut arch = self.archives[store_id].lock();
            if save_logs {
                self.ensure_cur_binlog_fs(store_id as u32, &mut arch, start)?;
                let Some(file) = arch.cur_file.as_mut() else {
                    return Err(Error::Internal("archive file unavailable".into()));
                };
                let result = txn.truncate_binlog(start, end, Some(&mut file.writer))?;
                self.update_cur_binlog_fs(&mut arch, result.written, result.timestamp, false)?;
                result
            } else {
                txn.truncate_binlog(start, end, None)?
            }
        };
        txn.commit()?;

        debug!(
            store = store_id,
            from = start,
            to = result.new_start,
            addr = %format!("{}:{}", self.network.ip(), self.network.port()),
            "binlog truncated"
        );
        *outcome = Some((result.new_start, result.timestamp));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::MockProtocol;
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::ReplicationConfig;
    use crate::network::Network;
    use crate::store::{MemStore, SegmentManager, SharedStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager_with_dump(dir: &TempDir, compression: bool) -> Arc<ReplManager> {
        let cfg = ReplicationConfig {
            dump_path: dir.path().join("dump"),
            dump_compression: compression,
            ..ReplicationConfig::default()
        };
        let catalog = Arc::new(Catalog::open(&dir.path().join("catalog")).unwrap());
        let seg_mgr = Arc::new(SegmentManager::new(vec![
            Arc::new(MemStore::new(0)) as SharedStore
        ]));
        let network = Arc::new(Network::new("127.0.0.1", 6380));
        ReplManager::new(cfg, catalog, seg_mgr, network, Arc::new(MockProtocol::default()))
    }

    #[test]
    fn test_parse_file_seq() {
        assert_eq!(parse_file_seq("binlog-0-7-100.log").unwrap(), 7);
        assert_eq!(parse_file_seq("binlog-3-12-1.log.lz4").unwrap(), 12);
        assert!(parse_file_seq("binlog-0").is_err());
        assert!(parse_file_seq("binlog-0-abc-1.log").is_err());
        assert!(parse_file_seq("binlog-0-99999999999-1.log").is_err());
    }

    #[test]
    fn test_max_dump_file_seq_scans_recursively() {
        let dir = TempDir::new().unwrap();
        let mgr = manager_with_dump(&dir, false);

        // first call creates the directories
        assert_eq!(mgr.max_dump_file_seq(0).unwrap(), 0);

        let sub = dir.path().join("dump").join("0");
        std::fs::write(sub.join("binlog-0-3-50.log"), b"x").unwrap();
        std::fs::write(sub.join("binlog-0-7-100.log"), b"x").unwrap();
        // non-matching names are ignored
        std::fs::write(sub.join("notes.txt"), b"x").unwrap();
        // nested directories are scanned
        let nested = sub.join("old");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("binlog-0-9-1.log"), b"x").unwrap();

        assert_eq!(mgr.max_dump_file_seq(0).unwrap(), 9);
    }

    #[test]
    fn test_max_dump_file_seq_rejects_bad_sequence() {
        let dir = TempDir::new().unwrap();
        let mgr = manager_with_dump(&dir, false);
        mgr.max_dump_file_seq(0).unwrap();

        let sub = dir.path().join("dump").join("0");
        std::fs::write(sub.join("binlog-0-bogus-1.log"), b"x").unwrap();
        assert!(mgr.max_dump_file_seq(0).is_err());
    }

    #[test]
    fn test_new_files_use_greater_sequence() {
        let dir = TempDir::new().unwrap();
        let mgr = manager_with_dump(&dir, false);
        mgr.max_dump_file_seq(0).unwrap();
        let sub = dir.path().join("dump").join("0");
        std::fs::write(sub.join("binlog-0-7-1.log"), b"x").unwrap();

        let mut arch = ArchiveState::new();
        arch.file_seq = mgr.max_dump_file_seq(0).unwrap();
        mgr.ensure_cur_binlog_fs(0, &mut arch, 1).unwrap();

        assert_eq!(arch.file_seq, 8);
        let path = arch.cur_file.as_ref().unwrap().path.clone();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("binlog-0-8-"));
    }

    #[test]
    fn test_rotation_advances_sequence() {
        let dir = TempDir::new().unwrap();
        let mgr = manager_with_dump(&dir, false);

        let mut arch = ArchiveState::new();
        mgr.ensure_cur_binlog_fs(0, &mut arch, 1).unwrap();
        assert_eq!(arch.file_seq, 1);
        arch.cur_file.as_mut().unwrap().writer.write_all(b"abc").unwrap();

        // force rotation, then open a new file
        mgr.update_cur_binlog_fs(&mut arch, 3, 42, true).unwrap();
        assert!(arch.cur_file.is_none());
        mgr.ensure_cur_binlog_fs(0, &mut arch, 4).unwrap();
        assert_eq!(arch.file_seq, 2);
    }

    #[test]
    fn test_lz4_archive_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mgr = manager_with_dump(&dir, true);

        let record = crate::store::BinlogRecord {
            id: 5,
            timestamp_ms: 123,
            payload: vec![7u8; 64],
        };

        let mut arch = ArchiveState::new();
        mgr.ensure_cur_binlog_fs(0, &mut arch, 5).unwrap();
        let path = arch.cur_file.as_ref().unwrap().path.clone();
        let written =
            crate::store::write_record_frame(&mut arch.cur_file.as_mut().unwrap().writer, &record)
                .unwrap();
        mgr.update_cur_binlog_fs(&mut arch, written, record.timestamp_ms, true)
            .unwrap();

        let file = File::open(&path).unwrap();
        let mut reader = lz4_flex::frame::FrameDecoder::new(file);
        let restored = crate::store::read_record_frame(&mut reader).unwrap().unwrap();
        assert_eq!(restored, record);
    }
}
