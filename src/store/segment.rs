//! Segment Manager
//!
//! Owns the node's store slots and hands out store handles under a lock
//! mode. Store locks are always taken outside the replication manager's
//! central mutex.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

use super::SharedStore;

/// Lock mode for a store handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// No store lock; metadata-only access
    LockNone,
    /// Intention lock, shared with normal reads and writes
    LockIx,
    /// Exclusive lock; blocks all other holders
    LockX,
}

struct Slot {
    store: SharedStore,
    lock: RwLock<()>,
}

/// Resolves store handles by id
pub struct SegmentManager {
    slots: Vec<Slot>,
}

/// A store resolved under a lock mode; the lock is held for the handle's
/// lifetime
pub struct StoreHandle<'a> {
    /// The resolved store
    pub store: SharedStore,
    _guard: HandleGuard<'a>,
}

enum HandleGuard<'a> {
    None,
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

impl SegmentManager {
    /// Create a manager over a fixed set of stores
    pub fn new(stores: Vec<SharedStore>) -> Self {
        Self {
            slots: stores
                .into_iter()
                .map(|store| Slot {
                    store,
                    lock: RwLock::new(()),
                })
                .collect(),
        }
    }

    /// Number of stores on this node
    pub fn store_count(&self) -> usize {
        self.slots.len()
    }

    /// Resolve a store handle under the requested lock mode
    pub fn get_store(&self, store_id: u32, mode: LockMode) -> Result<StoreHandle<'_>> {
        let slot = self
            .slots
            .get(store_id as usize)
            .ok_or(Error::UnknownStore(store_id))?;
        let guard = match mode {
            LockMode::LockNone => HandleGuard::None,
            LockMode::LockIx => HandleGuard::Shared(slot.lock.read()),
            LockMode::LockX => HandleGuard::Exclusive(slot.lock.write()),
        };
        Ok(StoreHandle {
            store: slot.store.clone(),
            _guard: guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use std::sync::Arc;

    fn manager(n: u32) -> SegmentManager {
        SegmentManager::new(
            (0..n)
                .map(|i| Arc::new(MemStore::new(i)) as SharedStore)
                .collect(),
        )
    }

    #[test]
    fn test_resolves_by_id() {
        let mgr = manager(3);
        assert_eq!(mgr.store_count(), 3);
        let handle = mgr.get_store(2, LockMode::LockNone).unwrap();
        assert_eq!(handle.store.id(), 2);
        assert!(matches!(
            mgr.get_store(3, LockMode::LockNone),
            Err(Error::UnknownStore(3))
        ));
    }

    #[test]
    fn test_shared_handles_coexist() {
        let mgr = manager(1);
        let a = mgr.get_store(0, LockMode::LockIx).unwrap();
        let b = mgr.get_store(0, LockMode::LockIx).unwrap();
        assert_eq!(a.store.id(), b.store.id());
    }

    #[test]
    fn test_exclusive_blocks_shared() {
        let mgr = manager(1);
        let x = mgr.get_store(0, LockMode::LockX).unwrap();
        // an exclusive holder blocks further lock acquisition on the slot
        assert!(mgr.slots[0].lock.try_read().is_none());
        drop(x);
        assert!(mgr.slots[0].lock.try_read().is_some());
    }
}
