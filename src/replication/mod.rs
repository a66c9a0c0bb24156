//! Replication
//!
//! Asynchronous binlog replication between a master node and its slaves,
//! per store, plus local binlog recycling. One controller thread schedules
//! slave-side pulls, master-side pushes and recycle runs onto fixed-width
//! worker pools; all scheduling state sits behind one central mutex.

mod info;
mod manager;
mod meta;
mod protocol;
mod rate_limiter;
mod recycle;
mod status;
#[cfg(test)]
mod testutil;
mod worker;

pub use manager::{FlushListener, ReplManager};
pub use meta::{ReplState, StoreMeta};
pub use protocol::{SyncProtocol, TcpSyncProtocol};
pub use rate_limiter::RateLimiter;
pub use status::{
    FullPushState, FullPushStatus, IncrPushStatus, RecycleStatus, SchedTime, SlavePovStatus,
};
pub use worker::WorkerPool;
