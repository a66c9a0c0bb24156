//! In-Memory Store Engine
//!
//! A small KV engine with a real binlog, used by the test suite and as an
//! embeddable cache shard. Every write appends a binlog record; truncation,
//! snapshot export/import and replicated apply all go through the same
//! record format the replication manager archives and ships.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{
    write_record_frame, BinlogId, BinlogRecord, Store, StoreMode, StoreTransaction,
    TruncateResult, MIN_VALID_TXNID, TXNID_UNINITED,
};

/// Upper bound on records removed in one truncation pass
const MAX_TRUNCATE_BATCH: usize = 50_000;

/// KV operation carried in a binlog record payload
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Op {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    anchor: BinlogId,
    entries: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
struct MemState {
    kv: HashMap<String, Vec<u8>>,
    binlog: BTreeMap<BinlogId, BinlogRecord>,
    next_binlog_id: BinlogId,
}

struct StoreInner {
    id: u32,
    open: AtomicBool,
    running: AtomicBool,
    mode: Mutex<StoreMode>,
    state: RwLock<MemState>,
}

/// In-memory store with a binlog
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<StoreInner>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl MemStore {
    /// Create an open, running store
    pub fn new(id: u32) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                id,
                open: AtomicBool::new(true),
                running: AtomicBool::new(true),
                mode: Mutex::new(StoreMode::ReadWrite),
                state: RwLock::new(MemState {
                    kv: HashMap::new(),
                    binlog: BTreeMap::new(),
                    next_binlog_id: MIN_VALID_TXNID,
                }),
            }),
        }
    }

    /// Mark the store closed; a closed store is never scheduled
    pub fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Toggle the running flag without closing the store
    pub fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::SeqCst);
    }

    /// Write a key, appending a binlog record
    pub fn put(&self, key: &str, value: &[u8]) -> Result<BinlogId> {
        if self.mode() == StoreMode::ReplicateOnly {
            return Err(Error::Manual("store is in replicate-only mode".into()));
        }
        self.log_and_apply(Op::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })
    }

    /// Delete a key, appending a binlog record
    pub fn delete(&self, key: &str) -> Result<BinlogId> {
        if self.mode() == StoreMode::ReplicateOnly {
            return Err(Error::Manual("store is in replicate-only mode".into()));
        }
        self.log_and_apply(Op::Del {
            key: key.to_string(),
        })
    }

    /// Read a key
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.state.read().kv.get(key).cloned()
    }

    fn log_and_apply(&self, op: Op) -> Result<BinlogId> {
        let payload = bincode::serialize(&op)?;
        let mut state = self.inner.state.write();
        let id = state.next_binlog_id;
        state.next_binlog_id = id + 1;
        apply_op(&mut state.kv, &op);
        state.binlog.insert(
            id,
            BinlogRecord {
                id,
                timestamp_ms: now_ms(),
                payload,
            },
        );
        Ok(id)
    }
}

fn apply_op(kv: &mut HashMap<String, Vec<u8>>, op: &Op) {
    match op {
        Op::Put { key, value } => {
            kv.insert(key.clone(), value.clone());
        }
        Op::Del { key } => {
            kv.remove(key);
        }
    }
}

impl Store for MemStore {
    fn id(&self) -> u32 {
        self.inner.id
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.inner.state.read().kv.is_empty())
    }

    fn mode(&self) -> StoreMode {
        *self.inner.mode.lock()
    }

    fn set_mode(&self, mode: StoreMode) -> Result<()> {
        *self.inner.mode.lock() = mode;
        Ok(())
    }

    fn highest_binlog_id(&self) -> Result<BinlogId> {
        Ok(self.inner.state.read().next_binlog_id - 1)
    }

    fn min_binlog(&self) -> Result<BinlogRecord> {
        self.inner
            .state
            .read()
            .binlog
            .values()
            .next()
            .cloned()
            .ok_or(Error::Exhaust)
    }

    fn binlogs_since(&self, from: BinlogId, limit: usize) -> Result<Vec<BinlogRecord>> {
        let state = self.inner.state.read();
        Ok(state
            .binlog
            .range((Bound::Excluded(from), Bound::Unbounded))
            .take(limit)
            .map(|(_, rec)| rec.clone())
            .collect())
    }

    fn apply_binlog(&self, record: &BinlogRecord) -> Result<()> {
        let op: Op = bincode::deserialize(&record.payload)?;
        let mut state = self.inner.state.write();
        if record.id < state.next_binlog_id {
            return Err(Error::Internal(format!(
                "stale binlog record {} applied to store {}",
                record.id, self.inner.id
            )));
        }
        apply_op(&mut state.kv, &op);
        state.binlog.insert(record.id, record.clone());
        state.next_binlog_id = record.id + 1;
        Ok(())
    }

    fn export_snapshot(&self, w: &mut dyn Write) -> Result<BinlogId> {
        let state = self.inner.state.read();
        let anchor = state.next_binlog_id - 1;
        let snapshot = Snapshot {
            anchor,
            entries: state
                .kv
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        bincode::serialize_into(w, &snapshot)?;
        Ok(anchor)
    }

    fn import_snapshot(&self, r: &mut dyn Read) -> Result<BinlogId> {
        let snapshot: Snapshot = bincode::deserialize_from(r)?;
        let mut state = self.inner.state.write();
        state.kv = snapshot.entries.into_iter().collect();
        state.binlog.clear();
        state.next_binlog_id = snapshot.anchor + 1;
        Ok(snapshot.anchor)
    }

    fn create_transaction(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemTransaction {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }
}

/// Truncation transaction against a [`MemStore`]
struct MemTransaction {
    inner: Arc<StoreInner>,
    staged: Vec<BinlogId>,
}

impl StoreTransaction for MemTransaction {
    fn truncate_binlog(
        &mut self,
        start: BinlogId,
        end: BinlogId,
        mut sink: Option<&mut dyn Write>,
    ) -> Result<TruncateResult> {
        let state = self.inner.state.read();

        if state.binlog.is_empty() {
            let new_start = if start == TXNID_UNINITED {
                MIN_VALID_TXNID
            } else {
                start
            };
            return Ok(TruncateResult {
                new_start,
                written: 0,
                timestamp: 0,
            });
        }

        let mut written = 0u64;
        let mut timestamp = 0u64;
        let mut last_victim = None;
        for (&id, record) in state.binlog.range(..end).take(MAX_TRUNCATE_BATCH) {
            if let Some(w) = sink.as_mut() {
                written += write_record_frame(&mut **w, record)?;
            }
            timestamp = record.timestamp_ms;
            last_victim = Some(id);
            self.staged.push(id);
        }

        let new_start = match last_victim {
            Some(last) => state
                .binlog
                .range((Bound::Excluded(last), Bound::Unbounded))
                .next()
                .map(|(&id, _)| id)
                .unwrap_or(state.next_binlog_id),
            // nothing below `end`: the retained minimum is already the bound
            None => state
                .binlog
                .keys()
                .next()
                .copied()
                .unwrap_or(MIN_VALID_TXNID),
        };

        Ok(TruncateResult {
            new_start,
            written,
            timestamp,
        })
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.inner.state.write();
        for id in &self.staged {
            state.binlog.remove(id);
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
