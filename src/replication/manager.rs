//! Replication Manager
//!
//! Per-node subsystem driving asynchronous binlog replication between a
//! master and its slaves, in both directions, across every store on the
//! node. A single controller thread inspects all stores under one central
//! mutex once per tick and dispatches at most one job per idle (store,
//! role) slot onto fixed-width worker pools. Workers run without the
//! central mutex and re-acquire it only to publish results and release
//! their slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::network::{BlockingClient, Network};
use crate::store::{
    BinlogId, LockMode, SegmentManager, SharedStore, StoreMode, MIN_VALID_TXNID, TXNID_UNINITED,
};

use super::meta::{ReplState, StoreMeta};
use super::protocol::SyncProtocol;
use super::rate_limiter::RateLimiter;
use super::recycle::ArchiveState;
use super::status::{
    FullPushState, FullPushStatus, IncrPushStatus, RecycleStatus, SchedTime, SlavePovStatus,
};
use super::worker::WorkerPool;

/// Read/line buffer capacity of replication clients
const CLIENT_BUFFER_CAPACITY: usize = 64 * 1024 * 1024;

/// The incremental check pool has a fixed width
const INCR_CHECK_THREADS: usize = 2;

/// Controller sleep between idle ticks
const CONTROLLER_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Succeeded full push records are kept this long for observability
const FULL_PUSH_EXPIRE: Duration = Duration::from_secs(600);

/// Backoff after an incremental check found nothing to do
const SLAVE_IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// Backoff after a push found the subscriber fully caught up
const PUSH_IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// Window for the AUTH reply when connecting to a master
const AUTH_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener interface the storage engine calls into on user-level flushes
pub trait FlushListener: Send + Sync {
    /// A flush made all binlog records up to `binlog_id` moot
    fn on_flush(&self, store_id: u32, binlog_id: BinlogId);

    /// Finalize the archive file the store is currently appending to
    fn flush_archive_file(&self, store_id: u32);
}

pub(super) struct ManagerState {
    pub(super) sync_meta: Vec<StoreMeta>,
    pub(super) slave_pov: Vec<SlavePovStatus>,
    pub(super) push_status: Vec<HashMap<u64, IncrPushStatus>>,
    pub(super) full_push_status: Vec<HashMap<String, FullPushStatus>>,
    pub(super) recycle: Vec<RecycleStatus>,
    pub(super) connect_master_timeout_ms: u64,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            sync_meta: Vec::new(),
            slave_pov: Vec::new(),
            push_status: Vec::new(),
            full_push_status: Vec::new(),
            recycle: Vec::new(),
            connect_master_timeout_ms: 1000,
        }
    }
}

struct WorkerPools {
    incr_pusher: WorkerPool,
    full_pusher: WorkerPool,
    full_receiver: WorkerPool,
    incr_checker: WorkerPool,
    log_recycler: WorkerPool,
}

/// Replication manager of one node
pub struct ReplManager {
    pub(super) cfg: ReplicationConfig,
    catalog: Arc<Catalog>,
    pub(super) seg_mgr: Arc<SegmentManager>,
    pub(super) network: Arc<Network>,
    protocol: Arc<dyn SyncProtocol>,
    pub(super) rate_limiter: RateLimiter,
    pub(super) state: Mutex<ManagerState>,
    cv: Condvar,
    pub(super) archives: Vec<Mutex<ArchiveState>>,
    running: AtomicBool,
    pub(super) incr_paused: AtomicBool,
    client_id_gen: AtomicU64,
    pools: OnceLock<WorkerPools>,
    controller: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<ReplManager>,
}

impl ReplManager {
    /// Create a manager; no job runs until [`ReplManager::startup`]
    pub fn new(
        cfg: ReplicationConfig,
        catalog: Arc<Catalog>,
        seg_mgr: Arc<SegmentManager>,
        network: Arc<Network>,
        protocol: Arc<dyn SyncProtocol>,
    ) -> Arc<Self> {
        let store_count = seg_mgr.store_count();
        let rate_limiter = RateLimiter::new(cfg.rate_limit_bytes());
        Arc::new_cyclic(|self_ref| Self {
            cfg,
            catalog,
            seg_mgr,
            network,
            protocol,
            rate_limiter,
            state: Mutex::new(ManagerState::new()),
            cv: Condvar::new(),
            archives: (0..store_count)
                .map(|_| Mutex::new(ArchiveState::new()))
                .collect(),
            running: AtomicBool::new(false),
            incr_paused: AtomicBool::new(false),
            client_id_gen: AtomicU64::new(0),
            pools: OnceLock::new(),
            controller: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    fn handle(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("manager self reference outlives the manager")
    }

    fn pools(&self) -> &WorkerPools {
        self.pools.get().expect("worker pools started")
    }

    /// Load metadata, start the worker pools, initialize every store's
    /// runtime state and launch the controller thread
    pub fn startup(&self) -> Result<()> {
        let store_count = self.seg_mgr.store_count();

        let mut sync_meta = Vec::with_capacity(store_count);
        for i in 0..store_count {
            match self.catalog.store_meta(i as u32) {
                Ok(meta) => sync_meta.push(meta),
                Err(Error::NotFound(_)) => {
                    let meta = StoreMeta::new_default(i as u32);
                    self.catalog.set_store_meta(&meta)?;
                    sync_meta.push(meta);
                }
                Err(e) => return Err(e),
            }
        }
        for (i, meta) in sync_meta.iter().enumerate() {
            if meta.id as usize != i {
                return Err(Error::Internal(format!(
                    "catalog meta {} carries id {}",
                    i, meta.id
                )));
            }
        }

        let pools = WorkerPools {
            incr_pusher: WorkerPool::start("repl-incr-push", self.cfg.incr_push_threads)?,
            full_pusher: WorkerPool::start("repl-full-push", self.cfg.full_push_threads)?,
            full_receiver: WorkerPool::start("repl-full-recv", self.cfg.full_receive_threads)?,
            incr_checker: WorkerPool::start("repl-incr-check", INCR_CHECK_THREADS)?,
            log_recycler: WorkerPool::start("log-recycle", self.cfg.log_recycle_threads)?,
        };
        if self.pools.set(pools).is_err() {
            return Err(Error::Internal("replication manager already started".into()));
        }

        let now = Instant::now();
        let mut slave_pov = Vec::with_capacity(store_count);
        let mut push_status = Vec::with_capacity(store_count);
        let mut full_push_status = Vec::with_capacity(store_count);
        let mut recycle = Vec::with_capacity(store_count);

        for i in 0..store_count {
            // starting up; no store lock is taken
            let handle = self.seg_mgr.get_store(i as u32, LockMode::LockNone)?;
            let store = &handle.store;
            let is_open = store.is_open();

            let sched = if is_open {
                SchedTime::at(now)
            } else {
                info!(store = i, "store is not opened, scheduling disabled");
                SchedTime::disabled()
            };

            slave_pov.push(SlavePovStatus::new(sched));
            push_status.push(HashMap::new());
            full_push_status.push(HashMap::new());

            let mut status = RecycleStatus::new(sched);
            if is_open {
                if sync_meta[i].sync_from_host.is_empty() {
                    store.set_mode(StoreMode::ReadWrite)?;
                } else {
                    store.set_mode(StoreMode::ReplicateOnly)?;
                    // a slave's durable binlog position is the source of
                    // truth, not the cached meta
                    sync_meta[i].binlog_id = store.highest_binlog_id()?;
                }

                let file_seq = self.max_dump_file_seq(i as u32)?;
                self.archives[i].lock().file_seq = file_seq;

                match store.min_binlog() {
                    Ok(record) => {
                        status.first_binlog_id = record.id;
                        status.timestamp = record.timestamp_ms;
                    }
                    Err(Error::Exhaust) => {
                        status.first_binlog_id = MIN_VALID_TXNID;
                        status.timestamp = 0;
                    }
                    Err(e) => return Err(e),
                }
                status.last_flush_binlog_id = TXNID_UNINITED;
            }
            info!(
                store = i,
                first_binlog = status.first_binlog_id,
                timestamp = status.timestamp,
                "replication state loaded"
            );
            recycle.push(status);
        }

        {
            let mut st = self.state.lock();
            st.sync_meta = sync_meta;
            st.slave_pov = slave_pov;
            st.push_status = push_status;
            st.full_push_status = full_push_status;
            st.recycle = recycle;
        }

        self.running.store(true, Ordering::SeqCst);
        let mgr = self.handle();
        let controller = std::thread::Builder::new()
            .name("repl-ctrl".to_string())
            .spawn(move || mgr.control_routine())
            .map_err(|e| Error::Internal(format!("failed to start controller: {}", e)))?;
        *self.controller.lock() = Some(controller);
        Ok(())
    }

    /// Join the controller, then stop every worker pool
    pub fn stop(&self) {
        warn!("replication manager begins stop");
        self.running.store(false, Ordering::SeqCst);
        if let Some(controller) = self.controller.lock().take() {
            let _ = controller.join();
        }
        // pools must be fully stopped before the state their jobs touch
        // goes away
        if let Some(pools) = self.pools.get() {
            pools.full_pusher.stop();
            pools.incr_pusher.stop();
            pools.full_receiver.stop();
            pools.incr_checker.stop();
            pools.log_recycler.stop();
        }
        warn!("replication manager stopped");
    }

    /// Park every scheduling slot of a store; in-flight jobs finish and
    /// find their slot disabled
    pub fn stop_store(&self, store_id: u32) -> Result<()> {
        let i = store_id as usize;
        let mut st = self.state.lock();
        if i >= st.slave_pov.len() {
            return Err(Error::UnknownStore(store_id));
        }
        st.slave_pov[i].next_sched_time.disable();
        st.recycle[i].next_sched_time.disable();
        for status in st.push_status[i].values_mut() {
            status.next_sched_time.disable();
        }
        st.full_push_status[i].clear();
        Ok(())
    }

    fn control_routine(&self) {
        info!("replication controller started");
        while self.running.load(Ordering::Relaxed) {
            let now = Instant::now();
            let mut did_work = false;
            {
                let mut st = self.state.lock();
                did_work |= self.sched_slave_locked(&mut st, now);
                did_work |= self.sched_master_locked(&mut st, now);
                did_work |= self.sched_recycle_locked(&mut st, now);
            }
            if did_work {
                std::thread::yield_now();
            } else {
                std::thread::sleep(CONTROLLER_IDLE_SLEEP);
            }
        }
        info!("replication controller exits");
    }

    fn sched_slave_locked(&self, st: &mut ManagerState, now: Instant) -> bool {
        let mut did_work = false;
        for i in 0..st.slave_pov.len() {
            if st.slave_pov[i].is_running || !st.slave_pov[i].next_sched_time.due(now) {
                continue;
            }
            match st.sync_meta[i].repl_state {
                ReplState::None => {}
                ReplState::Connect => {
                    did_work = true;
                    st.slave_pov[i].is_running = true;
                    let mgr = self.handle();
                    self.pools()
                        .full_receiver
                        .schedule(move || mgr.slave_sync_routine(i));
                }
                ReplState::Connected => {
                    did_work = true;
                    st.slave_pov[i].is_running = true;
                    let mgr = self.handle();
                    self.pools()
                        .incr_checker
                        .schedule(move || mgr.slave_sync_routine(i));
                }
                ReplState::Transfer => {
                    error!(store = i, "scheduler observed a store in transfer");
                    panic!("store {} must not be visible in transfer state", i);
                }
            }
        }
        did_work
    }

    fn sched_master_locked(&self, st: &mut ManagerState, now: Instant) -> bool {
        self.gc_full_push_locked(st, now);

        if self.incr_paused.load(Ordering::Relaxed) {
            return false;
        }
        let mut did_work = false;
        for i in 0..st.push_status.len() {
            let due: Vec<u64> = st.push_status[i]
                .values()
                .filter(|p| !p.is_running && p.next_sched_time.due(now))
                .map(|p| p.client_id)
                .collect();
            for client_id in due {
                did_work = true;
                if let Some(entry) = st.push_status[i].get_mut(&client_id) {
                    entry.is_running = true;
                }
                let mgr = self.handle();
                self.pools()
                    .incr_pusher
                    .schedule(move || mgr.master_push_routine(i, client_id));
            }
        }
        did_work
    }

    fn gc_full_push_locked(&self, st: &mut ManagerState, now: Instant) {
        for (store_id, statuses) in st.full_push_status.iter_mut().enumerate() {
            statuses.retain(|node, status| {
                let expired = status.state == FullPushState::Success
                    && status
                        .end_time
                        .map_or(false, |t| now.saturating_duration_since(t) > FULL_PUSH_EXPIRE);
                if expired {
                    warn!(
                        store = store_id,
                        node = %node,
                        binlog_pos = status.binlog_pos,
                        "expired full push status removed"
                    );
                }
                !expired
            });
        }
    }

    fn sched_recycle_locked(&self, st: &mut ManagerState, now: Instant) -> bool {
        let mut did_work = false;
        for i in 0..st.recycle.len() {
            if st.recycle[i].is_running || !st.recycle[i].next_sched_time.due(now) {
                continue;
            }
            did_work = true;
            st.recycle[i].is_running = true;
            let mgr = self.handle();
            self.pools()
                .log_recycler
                .schedule(move || mgr.recycle_binlog(i));
        }
        did_work
    }

    fn slave_sync_routine(&self, store_id: usize) {
        let meta = { self.state.lock().sync_meta[store_id].clone() };
        let branch = meta.repl_state;
        let result = match branch {
            ReplState::Connect => self.slave_full_sync(store_id, &meta),
            ReplState::Connected => self.slave_incr_check(store_id, &meta),
            state => {
                error!(store = store_id, state = %state, "slave job dispatched in unexpected state");
                panic!(
                    "slave job dispatched for store {} in state {}",
                    store_id, state
                );
            }
        };

        if let Err(e) = &result {
            warn!(store = store_id, error = %e, "slave sync failed");
        }

        let now = Instant::now();
        let mut st = self.state.lock();
        let backoff = match &result {
            Ok(()) if branch == ReplState::Connect => Duration::ZERO,
            Ok(()) => SLAVE_IDLE_BACKOFF,
            Err(_) => Duration::from_millis(st.connect_master_timeout_ms),
        };
        let slot = &mut st.slave_pov[store_id];
        debug_assert!(slot.is_running);
        slot.is_running = false;
        if result.is_ok() {
            slot.last_sync_time = now;
        }
        slot.next_sched_time.raise_to(now + backoff);
        self.cv.notify_all();
    }

    fn slave_full_sync(&self, store_id: usize, meta: &StoreMeta) -> Result<()> {
        let connect_timeout = { self.state.lock().connect_master_timeout_ms };
        {
            // the worker owns the store while the transfer holds; transfer
            // is transient and never persisted
            let mut st = self.state.lock();
            let mut transfer = st.sync_meta[store_id].clone();
            transfer.repl_state = ReplState::Transfer;
            self.change_repl_state_locked(&mut st, transfer, false);
        }

        let attempt = (|| {
            let handle = self.seg_mgr.get_store(store_id as u32, LockMode::LockNone)?;
            let mut client = self.create_client(meta, connect_timeout)?;
            let anchor = self
                .protocol
                .full_sync(handle.store.as_ref(), meta, &mut client)?;
            Ok::<_, Error>((client, anchor))
        })();

        match attempt {
            Ok((client, anchor)) => {
                let mut st = self.state.lock();
                let mut connected = st.sync_meta[store_id].clone();
                connected.repl_state = ReplState::Connected;
                connected.binlog_id = anchor;
                self.change_repl_state_locked(&mut st, connected, true);
                let slot = &mut st.slave_pov[store_id];
                slot.session_id = client.session_id();
                slot.client = Some(client);
                info!(
                    store = store_id,
                    anchor,
                    master = %format!("{}:{}", meta.sync_from_host, meta.sync_from_port),
                    "full sync finished"
                );
                Ok(())
            }
            Err(e) => {
                let mut st = self.state.lock();
                let mut retry = st.sync_meta[store_id].clone();
                retry.repl_state = ReplState::Connect;
                self.change_repl_state_locked(&mut st, retry, false);
                Err(e)
            }
        }
    }

    fn slave_incr_check(&self, store_id: usize, meta: &StoreMeta) -> Result<()> {
        let (existing, connect_timeout) = {
            let mut st = self.state.lock();
            (
                st.slave_pov[store_id].client.take(),
                st.connect_master_timeout_ms,
            )
        };

        let attempt = (|| {
            let handle = self.seg_mgr.get_store(store_id as u32, LockMode::LockNone)?;
            let store = handle.store.as_ref();
            let mut client = match existing {
                Some(client) => client,
                None => {
                    let mut client = self.create_client(meta, connect_timeout)?;
                    self.protocol.start_incr_sync(store, meta, &mut client)?;
                    client
                }
            };
            self.protocol.check_incr_sync(store, meta, &mut client)?;
            Ok::<_, Error>(client)
        })();

        match attempt {
            Ok(client) => {
                let mut st = self.state.lock();
                let slot = &mut st.slave_pov[store_id];
                slot.session_id = client.session_id();
                slot.client = Some(client);
                Ok(())
            }
            Err(e) => {
                // the session is gone; fall back to a fresh full sync
                let mut st = self.state.lock();
                st.slave_pov[store_id].session_id = None;
                let mut retry = st.sync_meta[store_id].clone();
                retry.repl_state = ReplState::Connect;
                self.change_repl_state_locked(&mut st, retry, true);
                Err(e)
            }
        }
    }

    fn master_push_routine(&self, store_id: usize, client_id: u64) {
        let (mut client, from) = {
            let mut st = self.state.lock();
            let Some(entry) = st.push_status[store_id].get_mut(&client_id) else {
                // subscriber detached between dispatch and execution
                return;
            };
            debug_assert!(entry.is_running);
            match entry.client.take() {
                Some(client) => (client, entry.binlog_pos),
                None => {
                    warn!(
                        store = store_id,
                        client = client_id,
                        "subscriber without a connection dropped"
                    );
                    st.push_status[store_id].remove(&client_id);
                    return;
                }
            }
        };

        let result = (|| {
            let handle = self.seg_mgr.get_store(store_id as u32, LockMode::LockIx)?;
            self.protocol
                .push_binlogs(handle.store.as_ref(), &mut client, from, &self.rate_limiter)
        })();

        let now = Instant::now();
        let mut st = self.state.lock();
        match st.push_status[store_id].get_mut(&client_id) {
            None => {
                // detached while pushing; the connection drops with us
            }
            Some(entry) => match result {
                Ok(acked) => {
                    let advanced = acked > entry.binlog_pos;
                    entry.binlog_pos = acked;
                    entry.is_running = false;
                    entry.client = Some(client);
                    let backoff = if advanced {
                        Duration::ZERO
                    } else {
                        PUSH_IDLE_BACKOFF
                    };
                    entry.next_sched_time.raise_to(now + backoff);
                }
                Err(e) => {
                    warn!(
                        store = store_id,
                        client = client_id,
                        error = %e,
                        "incremental push failed, dropping subscriber"
                    );
                    st.push_status[store_id].remove(&client_id);
                }
            },
        }
    }

    /// Change or clear a store's replication source. An empty `ip`
    /// detaches the store and makes it master-writable again.
    pub fn change_repl_source(
        &self,
        store_id: u32,
        ip: &str,
        port: u16,
        source_store_id: u32,
    ) -> Result<()> {
        let handle = self.seg_mgr.get_store(store_id, LockMode::LockX)?;
        if !handle.store.is_open() {
            return Ok(());
        }
        if !ip.is_empty() && !handle.store.is_empty()? {
            return Err(Error::Manual("store not empty".into()));
        }
        self.change_repl_source_in_lock(&handle.store, store_id, ip, port, source_store_id)
    }

    // callers hold LOCK_X on the store
    fn change_repl_source_in_lock(
        &self,
        store: &SharedStore,
        store_id: u32,
        ip: &str,
        port: u16,
        source_store_id: u32,
    ) -> Result<()> {
        let i = store_id as usize;
        let mut st = self.state.lock();
        if i >= st.sync_meta.len() {
            return Err(Error::Internal(format!("invalid store id {}", store_id)));
        }

        let old_timeout = st.connect_master_timeout_ms;
        st.connect_master_timeout_ms = if ip.is_empty() { 1 } else { 1000 };

        // the slot must drain before the meta changes, or a worker could
        // rewrite it underneath us
        info!(store = store_id, "waiting for slave slot to yield");
        let deadline = Instant::now() + Duration::from_millis(old_timeout + 2000);
        while st.slave_pov[i].is_running {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(
                    "timed out waiting for replication job to yield".into(),
                ));
            }
            let _ = self.cv.wait_for(&mut st, deadline - now);
        }
        debug_assert!(!st.slave_pov[i].is_running);

        let mut new_meta = st.sync_meta[i].clone();
        if !ip.is_empty() {
            if !st.sync_meta[i].sync_from_host.is_empty() {
                return Err(Error::Busy(
                    "set the sync source empty before changing it".into(),
                ));
            }
            store.set_mode(StoreMode::ReplicateOnly)?;
            new_meta.sync_from_host = ip.to_string();
            new_meta.sync_from_port = port;
            new_meta.sync_from_id = source_store_id;
            new_meta.repl_state = ReplState::Connect;
            new_meta.binlog_id = TXNID_UNINITED;
            info!(
                store = store_id,
                source = %format!("{}:{}:{}", ip, port, source_store_id),
                "replication source attached"
            );
            self.change_repl_state_locked(&mut st, new_meta, true);
            Ok(())
        } else {
            if new_meta.sync_from_host.is_empty() {
                return Ok(());
            }
            info!(
                store = store_id,
                source = %new_meta.sync_from_host,
                "replication source detached"
            );
            if let Some(session_id) = st.slave_pov[i].session_id.take() {
                if let Err(e) = self.network.cancel_session(session_id) {
                    // does not affect much, log and continue
                    warn!(store = store_id, error = %e, "cancelling slave session failed");
                }
            }
            st.slave_pov[i].client = None;
            store.set_mode(StoreMode::ReadWrite)?;
            new_meta.sync_from_host = String::new();
            new_meta.sync_from_port = 0;
            new_meta.sync_from_id = 0;
            new_meta.repl_state = ReplState::None;
            new_meta.binlog_id = TXNID_UNINITED;
            self.change_repl_state_locked(&mut st, new_meta, true);
            Ok(())
        }
    }

    /// Install a new meta, persisting it first when `persist` is set.
    /// A catalog write failure during a state transition is fatal.
    fn change_repl_state_locked(&self, st: &mut ManagerState, meta: StoreMeta, persist: bool) {
        let i = meta.id as usize;
        let current = st.sync_meta[i].repl_state;
        if !current.can_transition_to(meta.repl_state) {
            error!(
                store = meta.id,
                from = %current,
                to = %meta.repl_state,
                "illegal replication state transition"
            );
            panic!(
                "illegal replication state transition on store {}: {} -> {}",
                meta.id, current, meta.repl_state
            );
        }
        if persist {
            if let Err(e) = self.catalog.set_store_meta(&meta) {
                error!(store = meta.id, error = %e, "catalog write failed during state transition");
                panic!("catalog write failed during state transition: {}", e);
            }
        }
        st.sync_meta[i] = meta;
    }

    /// Connect an authenticated blocking client to the meta's source
    pub fn create_client(&self, meta: &StoreMeta, timeout_ms: u64) -> Result<BlockingClient> {
        let mut client = self.network.create_blocking_client(CLIENT_BUFFER_CAPACITY);
        client
            .connect(
                &meta.sync_from_host,
                meta.sync_from_port,
                Duration::from_millis(timeout_ms.max(1)),
            )
            .map_err(|e| {
                warn!(
                    store = meta.id,
                    master = %format!("{}:{}", meta.sync_from_host, meta.sync_from_port),
                    error = %e,
                    "connecting to master failed"
                );
                e
            })?;

        if !self.cfg.masterauth.is_empty() {
            client.write_line(&format!("AUTH {}", self.cfg.masterauth))?;
            let reply = client.read_line(AUTH_REPLY_TIMEOUT)?;
            if reply.is_empty() || reply.starts_with('-') {
                info!(store = meta.id, reply = %reply, "master auth failed");
                return Err(Error::Network(format!("auth failed: {}", reply)));
            }
        }
        Ok(client)
    }

    /// Register a remote slave for incremental pushes; returns its client
    /// id. Called by the command layer when a subscriber attaches.
    pub fn register_incr_sync(
        &self,
        store_id: u32,
        dst_store_id: u32,
        binlog_pos: BinlogId,
        listen_ip: &str,
        listen_port: u16,
        client: BlockingClient,
    ) -> Result<u64> {
        let i = store_id as usize;
        let client_id = self.client_id_gen.fetch_add(1, Ordering::Relaxed);
        let mut st = self.state.lock();
        if i >= st.push_status.len() {
            return Err(Error::UnknownStore(store_id));
        }
        st.push_status[i].insert(
            client_id,
            IncrPushStatus {
                is_running: false,
                client_id,
                dst_store_id,
                binlog_pos,
                next_sched_time: SchedTime::now(),
                client: Some(client),
                slave_listen_ip: listen_ip.to_string(),
                slave_listen_port: listen_port,
            },
        );
        info!(
            store = store_id,
            client = client_id,
            binlog_pos,
            listen = %format!("{}:{}", listen_ip, listen_port),
            "incremental subscriber registered"
        );
        Ok(client_id)
    }

    /// Drop a subscriber; its connection is closed with the entry
    pub fn deregister_incr_sync(&self, store_id: u32, client_id: u64) -> Result<()> {
        let i = store_id as usize;
        let mut st = self.state.lock();
        if i >= st.push_status.len() {
            return Err(Error::UnknownStore(store_id));
        }
        match st.push_status[i].remove(&client_id) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!(
                "subscriber {} on store {}",
                client_id, store_id
            ))),
        }
    }

    /// Track a full snapshot push to `node_key` and run its body on the
    /// full push pool. Called by the command layer when a slave requests a
    /// full sync.
    pub fn dispatch_full_push<F>(
        &self,
        store_id: u32,
        node_key: &str,
        binlog_pos: BinlogId,
        job: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<BinlogId> + Send + 'static,
    {
        let i = store_id as usize;
        {
            let mut st = self.state.lock();
            if i >= st.full_push_status.len() {
                return Err(Error::UnknownStore(store_id));
            }
            if st.full_push_status[i].contains_key(node_key) {
                return Err(Error::Busy(format!(
                    "full push already tracked for {}",
                    node_key
                )));
            }
            st.full_push_status[i].insert(
                node_key.to_string(),
                FullPushStatus {
                    state: FullPushState::Running,
                    binlog_pos,
                    start_time: Instant::now(),
                    end_time: None,
                },
            );
        }

        let mgr = self.handle();
        let node_key = node_key.to_string();
        self.pools().full_pusher.schedule(move || {
            let result = job();
            let mut st = mgr.state.lock();
            if let Some(status) = st.full_push_status[i].get_mut(&node_key) {
                status.end_time = Some(Instant::now());
                match result {
                    Ok(anchor) => {
                        status.state = FullPushState::Success;
                        status.binlog_pos = anchor;
                    }
                    Err(e) => {
                        warn!(store = i, node = %node_key, error = %e, "full push failed");
                        status.state = FullPushState::Failed;
                    }
                }
            }
        });
        Ok(())
    }

    /// Pause or resume dispatching of incremental pushes
    pub fn set_incr_paused(&self, paused: bool) {
        self.incr_paused.store(paused, Ordering::Relaxed);
    }

    /// Whether incremental pushes are paused
    pub fn is_incr_paused(&self) -> bool {
        self.incr_paused.load(Ordering::Relaxed)
    }
}

impl FlushListener for ReplManager {
    fn on_flush(&self, store_id: u32, binlog_id: BinlogId) {
        let mut st = self.state.lock();
        if let Some(status) = st.recycle.get_mut(store_id as usize) {
            status.last_flush_binlog_id = binlog_id;
            info!(store = store_id, binlog_id, "flush recorded");
        }
    }

    fn flush_archive_file(&self, store_id: u32) {
        self.flush_cur_binlog_fs(store_id);
    }
}
