//! WolfCache Configuration
//!
//! Configuration structures for a WolfCache node. The replication section
//! controls the worker pools, binlog recycling cadence and the on-disk
//! binlog archive.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfCache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Replication manager configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address other nodes use to reach this one
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Port other nodes use to reach this one
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Data directory for the catalog and store state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Replication manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Outbound binlog push bandwidth cap in MiB/s
    #[serde(default = "default_binlog_rate_limit_mb")]
    pub binlog_rate_limit_mb: u32,

    /// Width of the incremental push pool (master side)
    #[serde(default = "default_push_threads")]
    pub incr_push_threads: usize,

    /// Width of the full snapshot push pool (master side)
    #[serde(default = "default_push_threads")]
    pub full_push_threads: usize,

    /// Width of the full snapshot receive pool (slave side)
    #[serde(default = "default_push_threads")]
    pub full_receive_threads: usize,

    /// Width of the binlog recycle pool
    #[serde(default = "default_push_threads")]
    pub log_recycle_threads: usize,

    /// Base interval between binlog recycle runs per store, jittered 0.8-1.2x
    #[serde(default = "default_truncate_binlog_interval_ms")]
    pub truncate_binlog_interval_ms: u64,

    /// Root directory of the binlog archive
    #[serde(default = "default_dump_path")]
    pub dump_path: PathBuf,

    /// Rotation threshold for archive files in MiB
    #[serde(default = "default_dump_file_size_mb")]
    pub dump_file_size_mb: u64,

    /// Compress archive files with LZ4
    #[serde(default)]
    pub dump_compression: bool,

    /// Password sent with AUTH when connecting to a master
    #[serde(default)]
    pub masterauth: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    6380
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_binlog_rate_limit_mb() -> u32 {
    64
}

fn default_push_threads() -> usize {
    4
}

fn default_truncate_binlog_interval_ms() -> u64 {
    1000
}

fn default_dump_path() -> PathBuf {
    PathBuf::from("./dump")
}

fn default_dump_file_size_mb() -> u64 {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            binlog_rate_limit_mb: default_binlog_rate_limit_mb(),
            incr_push_threads: default_push_threads(),
            full_push_threads: default_push_threads(),
            full_receive_threads: default_push_threads(),
            log_recycle_threads: default_push_threads(),
            truncate_binlog_interval_ms: default_truncate_binlog_interval_ms(),
            dump_path: default_dump_path(),
            dump_file_size_mb: default_dump_file_size_mb(),
            dump_compression: false,
            masterauth: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.listen_host.is_empty() {
            return Err(crate::Error::Config(
                "node.listen_host cannot be empty".into(),
            ));
        }

        let r = &self.replication;
        if r.binlog_rate_limit_mb == 0 {
            return Err(crate::Error::Config(
                "replication.binlog_rate_limit_mb must be positive".into(),
            ));
        }
        for (name, width) in [
            ("incr_push_threads", r.incr_push_threads),
            ("full_push_threads", r.full_push_threads),
            ("full_receive_threads", r.full_receive_threads),
            ("log_recycle_threads", r.log_recycle_threads),
        ] {
            if width == 0 {
                return Err(crate::Error::Config(format!(
                    "replication.{} must be positive",
                    name
                )));
            }
        }
        if r.truncate_binlog_interval_ms == 0 {
            return Err(crate::Error::Config(
                "replication.truncate_binlog_interval_ms must be positive".into(),
            ));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "unknown logging.level: {}",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Get the catalog directory path
    pub fn catalog_dir(&self) -> PathBuf {
        self.node.data_dir.join("catalog")
    }
}

impl ReplicationConfig {
    /// Outbound push bandwidth cap in bytes per second
    pub fn rate_limit_bytes(&self) -> u64 {
        self.binlog_rate_limit_mb as u64 * 1024 * 1024
    }

    /// Archive rotation threshold in bytes
    pub fn dump_file_size_bytes(&self) -> u64 {
        self.dump_file_size_mb * 1024 * 1024
    }

    /// Base recycle interval as a Duration
    pub fn truncate_binlog_interval(&self) -> Duration {
        Duration::from_millis(self.truncate_binlog_interval_ms)
    }
}
