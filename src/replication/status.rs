//! Volatile Replication Status
//!
//! Runtime bookkeeping the controller schedules from. Everything here is
//! guarded by the manager's central mutex; none of it is persisted.

use std::time::Instant;

use crate::network::BlockingClient;
use crate::store::{BinlogId, TXNID_UNINITED};

/// Earliest eligible dispatch instant for a schedulable slot.
///
/// A disabled slot is never due and stays disabled through
/// [`SchedTime::raise_to`]; closed or stopped stores are parked this way.
#[derive(Debug, Clone, Copy)]
pub struct SchedTime(Option<Instant>);

impl SchedTime {
    /// Eligible immediately
    pub fn now() -> Self {
        SchedTime(Some(Instant::now()))
    }

    /// Eligible at `t`
    pub fn at(t: Instant) -> Self {
        SchedTime(Some(t))
    }

    /// Never eligible
    pub fn disabled() -> Self {
        SchedTime(None)
    }

    /// Whether scheduling is disabled for this slot
    pub fn is_disabled(&self) -> bool {
        self.0.is_none()
    }

    /// Whether the slot is eligible at `now`
    pub fn due(&self, now: Instant) -> bool {
        matches!(self.0, Some(t) if t <= now)
    }

    /// Push the eligible instant forward to `t`; never moves it earlier and
    /// never re-enables a disabled slot
    pub fn raise_to(&mut self, t: Instant) {
        if let Some(cur) = self.0 {
            if cur < t {
                self.0 = Some(t);
            }
        }
    }

    /// Disable scheduling for this slot
    pub fn disable(&mut self) {
        self.0 = None;
    }
}

/// Slave-side runtime state of one store
pub struct SlavePovStatus {
    /// Whether a slave-side job is in flight; at most one per store
    pub is_running: bool,
    /// Network session owning the connection to the master
    pub session_id: Option<u64>,
    /// Next eligible dispatch instant
    pub next_sched_time: SchedTime,
    /// Last observed successful progress, for lag reporting
    pub last_sync_time: Instant,
    /// Live tail connection to the master, owned by this slot
    pub client: Option<BlockingClient>,
}

impl SlavePovStatus {
    pub fn new(next_sched_time: SchedTime) -> Self {
        Self {
            is_running: false,
            session_id: None,
            next_sched_time,
            last_sync_time: Instant::now(),
            client: None,
        }
    }
}

/// Master-side incremental push state for one subscriber
pub struct IncrPushStatus {
    /// Whether a push job is in flight; at most one per subscriber
    pub is_running: bool,
    /// Subscriber id on this node
    pub client_id: u64,
    /// Store index on the subscriber
    pub dst_store_id: u32,
    /// Last binlog id the subscriber acknowledged
    pub binlog_pos: BinlogId,
    /// Next eligible dispatch instant
    pub next_sched_time: SchedTime,
    /// Connection to the subscriber, owned by this entry
    pub client: Option<BlockingClient>,
    /// Address the subscriber listens on, for stats
    pub slave_listen_ip: String,
    pub slave_listen_port: u16,
}

/// State of one full snapshot push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullPushState {
    Running,
    Success,
    Failed,
}

/// Master-side full push state for one subscriber node
pub struct FullPushStatus {
    pub state: FullPushState,
    /// Binlog id the pushed snapshot is anchored at
    pub binlog_pos: BinlogId,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
}

/// Binlog recycling state of one store
pub struct RecycleStatus {
    /// Whether a recycle job is in flight; at most one per store
    pub is_running: bool,
    /// Next eligible dispatch instant
    pub next_sched_time: SchedTime,
    /// Smallest binlog id currently retained in the store
    pub first_binlog_id: BinlogId,
    /// Cutover mark recorded when the engine flushed to disk
    pub last_flush_binlog_id: BinlogId,
    /// Timestamp of the oldest retained record, for stats
    pub timestamp: u64,
}

impl RecycleStatus {
    pub fn new(next_sched_time: SchedTime) -> Self {
        Self {
            is_running: false,
            next_sched_time,
            first_binlog_id: TXNID_UNINITED,
            last_flush_binlog_id: TXNID_UNINITED,
            timestamp: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sched_time_due() {
        let now = Instant::now();
        assert!(SchedTime::at(now).due(now));
        assert!(!SchedTime::at(now + Duration::from_secs(1)).due(now));
        assert!(!SchedTime::disabled().due(now));
    }

    #[test]
    fn test_raise_to_only_raises() {
        let now = Instant::now();
        let later = now + Duration::from_secs(5);

        let mut t = SchedTime::at(now);
        t.raise_to(later);
        assert!(!t.due(now));
        assert!(t.due(later));

        // raising backwards is a no-op
        t.raise_to(now);
        assert!(!t.due(now));
    }

    #[test]
    fn test_disabled_stays_disabled() {
        let mut t = SchedTime::disabled();
        t.raise_to(Instant::now());
        assert!(t.is_disabled());
    }
}
