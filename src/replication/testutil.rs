//! Shared test fixtures for the replication modules.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::catalog::Catalog;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::network::{BlockingClient, Network};
use crate::store::{MemStore, SegmentManager, SharedStore, Store};

use super::manager::ReplManager;
use super::meta::StoreMeta;
use super::protocol::SyncProtocol;
use super::rate_limiter::RateLimiter;

/// Scriptable protocol double; no byte ever leaves the process.
#[derive(Default)]
pub(super) struct MockProtocol {
    full_sync_anchor: AtomicU64,
    fail_full_sync: AtomicBool,
    fail_incr_check: AtomicBool,
    pub(super) full_syncs: AtomicUsize,
    pub(super) incr_checks: AtomicUsize,
    pub(super) pushes: AtomicUsize,
}

impl MockProtocol {
    pub(super) fn set_full_sync_anchor(&self, anchor: u64) {
        self.full_sync_anchor.store(anchor, Ordering::SeqCst);
    }

    pub(super) fn set_fail_full_sync(&self, fail: bool) {
        self.fail_full_sync.store(fail, Ordering::SeqCst);
    }

    pub(super) fn set_fail_incr_check(&self, fail: bool) {
        self.fail_incr_check.store(fail, Ordering::SeqCst);
    }
}

impl SyncProtocol for MockProtocol {
    fn full_sync(
        &self,
        _store: &dyn Store,
        _meta: &StoreMeta,
        _client: &mut BlockingClient,
    ) -> Result<u64> {
        self.full_syncs.fetch_add(1, Ordering::SeqCst);
        if self.fail_full_sync.load(Ordering::SeqCst) {
            return Err(Error::Network("scripted full sync failure".into()));
        }
        Ok(self.full_sync_anchor.load(Ordering::SeqCst))
    }

    fn start_incr_sync(
        &self,
        _store: &dyn Store,
        _meta: &StoreMeta,
        _client: &mut BlockingClient,
    ) -> Result<()> {
        Ok(())
    }

    fn check_incr_sync(
        &self,
        _store: &dyn Store,
        _meta: &StoreMeta,
        _client: &mut BlockingClient,
    ) -> Result<()> {
        self.incr_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_incr_check.load(Ordering::SeqCst) {
            return Err(Error::Network("scripted incr check failure".into()));
        }
        Ok(())
    }

    fn push_binlogs(
        &self,
        _store: &dyn Store,
        _client: &mut BlockingClient,
        from: u64,
        _limiter: &RateLimiter,
    ) -> Result<u64> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(from)
    }
}

pub(super) struct TestEnv {
    pub(super) mgr: Arc<ReplManager>,
    pub(super) stores: Vec<MemStore>,
    pub(super) catalog: Arc<Catalog>,
    pub(super) network: Arc<Network>,
    pub(super) dir: TempDir,
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.mgr.stop();
    }
}

/// Build a manager over `n` fresh in-memory stores. The recycle interval
/// defaults to one hour so only the initial pass runs unless a test dials
/// it down.
pub(super) fn env_with(
    n: usize,
    protocol: Arc<dyn SyncProtocol>,
    tweak: impl FnOnce(&mut ReplicationConfig),
) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let mut cfg = ReplicationConfig {
        dump_path: dir.path().join("dump"),
        truncate_binlog_interval_ms: 3_600_000,
        ..ReplicationConfig::default()
    };
    tweak(&mut cfg);

    let stores: Vec<MemStore> = (0..n).map(|i| MemStore::new(i as u32)).collect();
    let seg_mgr = Arc::new(SegmentManager::new(
        stores
            .iter()
            .map(|s| Arc::new(s.clone()) as SharedStore)
            .collect(),
    ));
    let catalog = Arc::new(Catalog::open(&dir.path().join("catalog")).unwrap());
    let network = Arc::new(Network::new("127.0.0.1", 6380));
    let mgr = ReplManager::new(
        cfg,
        Arc::clone(&catalog),
        seg_mgr,
        Arc::clone(&network),
        protocol,
    );
    TestEnv {
        mgr,
        stores,
        catalog,
        network,
        dir,
    }
}

/// A listener that accepts and parks connections so clients can connect.
pub(super) fn dummy_master() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept() {
            held.push(stream);
        }
    });
    addr
}

/// Poll `f` until it holds or `timeout` elapses.
pub(super) fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    f()
}
