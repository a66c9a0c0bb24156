//! Replication Metadata
//!
//! Per-store replication state machine and the durable metadata record the
//! catalog persists.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::store::{BinlogId, TXNID_UNINITED};

/// Replication state of one store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplState {
    /// Not replicating from anyone; the store is master-writable
    None,
    /// Has a configured source but no active session; the next slave tick
    /// attempts a full sync
    Connect,
    /// A full sync transfer is underway; the worker owns the store while
    /// this state holds and the scheduler must never observe it
    Transfer,
    /// Incremental session established; the store tails its master
    Connected,
}

impl ReplState {
    /// Stable string form used by the catalog and stats
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplState::None => "none",
            ReplState::Connect => "connect",
            ReplState::Transfer => "transfer",
            ReplState::Connected => "connected",
        }
    }

    /// Whether moving to `next` is a legal transition.
    ///
    /// Detaching is legal from any state; re-entering the current state is
    /// treated as a metadata refresh.
    pub fn can_transition_to(self, next: ReplState) -> bool {
        if next == self || next == ReplState::None {
            return true;
        }
        matches!(
            (self, next),
            (ReplState::None, ReplState::Connect)
                | (ReplState::Connect, ReplState::Transfer)
                | (ReplState::Transfer, ReplState::Connected)
                | (ReplState::Transfer, ReplState::Connect)
                | (ReplState::Connected, ReplState::Connect)
        )
    }
}

impl fmt::Display for ReplState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ReplState::None),
            "connect" => Ok(ReplState::Connect),
            "transfer" => Ok(ReplState::Transfer),
            "connected" => Ok(ReplState::Connected),
            other => Err(Error::Internal(format!(
                "unknown replication state: {}",
                other
            ))),
        }
    }
}

/// Durable replication metadata of one store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMeta {
    /// Store index; always equals the store's slot
    pub id: u32,
    /// Master host to replicate from; empty means this store is a master
    pub sync_from_host: String,
    /// Master port
    pub sync_from_port: u16,
    /// Store index on the master
    pub sync_from_id: u32,
    /// Current replication state
    pub repl_state: ReplState,
    /// Highest binlog id durably applied from the master
    pub binlog_id: BinlogId,
}

impl StoreMeta {
    /// Default metadata for a store that replicates from no one
    pub fn new_default(id: u32) -> Self {
        Self {
            id,
            sync_from_host: String::new(),
            sync_from_port: 0,
            sync_from_id: 0,
            repl_state: ReplState::None,
            binlog_id: TXNID_UNINITED,
        }
    }

    /// Whether this store has a configured replication source
    pub fn is_slave(&self) -> bool {
        !self.sync_from_host.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            ReplState::None,
            ReplState::Connect,
            ReplState::Transfer,
            ReplState::Connected,
        ] {
            assert_eq!(state.as_str().parse::<ReplState>().unwrap(), state);
        }
        assert!("bogus".parse::<ReplState>().is_err());
    }

    #[test]
    fn test_legal_transitions() {
        use ReplState::*;
        assert!(None.can_transition_to(Connect));
        assert!(Connect.can_transition_to(Transfer));
        assert!(Transfer.can_transition_to(Connected));
        assert!(Transfer.can_transition_to(Connect));
        assert!(Connected.can_transition_to(Connect));
        // detach is always legal
        assert!(Transfer.can_transition_to(None));
        assert!(Connected.can_transition_to(None));
    }

    #[test]
    fn test_illegal_transitions() {
        use ReplState::*;
        assert!(!None.can_transition_to(Transfer));
        assert!(!None.can_transition_to(Connected));
        assert!(!Connect.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Transfer));
    }

    #[test]
    fn test_default_meta() {
        let meta = StoreMeta::new_default(7);
        assert_eq!(meta.id, 7);
        assert!(!meta.is_slave());
        assert_eq!(meta.repl_state, ReplState::None);
        assert_eq!(meta.binlog_id, TXNID_UNINITED);
    }
}
