//! WolfCache - Sharded Redis-Compatible Key-Value Server
//!
//! WolfCache horizontally partitions data into a fixed number of
//! independent storage shards (stores), each with its own write-ahead
//! binlog, and keeps replicas in sync with asynchronous binlog
//! replication between a master node and one or more slaves.
//!
//! # Architecture
//!
//! Replication is strictly single-master per store. A node's replication
//! manager runs one controller thread that schedules slave-side pulls
//! (full snapshot or incremental tail), master-side pushes to attached
//! subscribers, and local binlog recycling onto fixed-width worker pools.
//! Reclaimed binlog records are archived into rolling dump files so a
//! late subscriber can still catch up.
//!
//! # Features
//!
//! - Per-store replication state machine with durable catalog metadata
//! - Full snapshot transfer plus incremental binlog tailing
//! - Binlog recycling that never outruns a live replication target
//! - Rolling, optionally LZ4-compressed binlog archive files
//! - Shared outbound bandwidth cap across all push jobs
//! - Redis-compatible `INFO replication` output and JSON stats

pub mod catalog;
pub mod config;
pub mod error;
pub mod network;
pub mod replication;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::Catalog;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::network::{BlockingClient, Network};
    pub use crate::replication::{
        FlushListener, ReplManager, ReplState, StoreMeta, SyncProtocol, TcpSyncProtocol,
    };
    pub use crate::store::{
        BinlogId, BinlogRecord, LockMode, MemStore, SegmentManager, Store, StoreMode,
    };
}
