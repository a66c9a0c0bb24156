//! Replication Introspection
//!
//! Redis-compatible `INFO replication` text and a structured JSON view,
//! both taken under the central mutex for a consistent snapshot.

use std::fmt::Write as _;
use std::time::Instant;

use serde_json::{json, Map, Value};

use crate::store::LockMode;

use super::manager::ReplManager;

impl ReplManager {
    /// Redis-compatible `INFO replication` body
    pub fn repl_info(&self) -> String {
        let mut out = String::new();
        self.repl_info_simple(&mut out);
        self.repl_info_detail(&mut out);
        out
    }

    fn repl_info_simple(&self, out: &mut String) {
        let st = self.state.lock();
        let now = Instant::now();

        let mut role = "master";
        let mut master_host = "";
        let mut master_port = 0u16;
        let mut master_last_io_seconds_ago: i64 = 0;
        for i in 0..st.sync_meta.len() {
            if st.sync_meta[i].is_slave() {
                role = "slave";
                master_host = st.sync_meta[i].sync_from_host.as_str();
                master_port = st.sync_meta[i].sync_from_port;
                let sec_ago = now
                    .saturating_duration_since(st.slave_pov[i].last_sync_time)
                    .as_secs() as i64;
                if sec_ago > master_last_io_seconds_ago {
                    master_last_io_seconds_ago = sec_ago;
                }
            }
        }

        let mut connected_slaves = 0usize;
        let mut slave_repl_offset: i64 = -1;
        for i in 0..st.push_status.len() {
            let Ok(handle) = self.seg_mgr.get_store(i as u32, LockMode::LockNone) else {
                return;
            };
            connected_slaves = st.push_status[i].len();
            let Ok(highest) = handle.store.highest_binlog_id() else {
                return;
            };
            for status in st.push_status[i].values() {
                let lag = highest as i64 - status.binlog_pos as i64;
                if lag > slave_repl_offset {
                    slave_repl_offset = lag;
                }
            }
        }

        let _ = write!(out, "role:{}\r\n", role);
        let _ = write!(out, "master_repl_offset:0\r\n");
        let _ = write!(out, "connected_slaves:{}\r\n", connected_slaves);
        if role == "slave" {
            let _ = write!(out, "master_host:{}\r\n", master_host);
            let _ = write!(out, "master_port:{}\r\n", master_port);
            let _ = write!(out, "master_link_status:up\r\n");
            let _ = write!(
                out,
                "master_last_io_seconds_ago:{}\r\n",
                master_last_io_seconds_ago
            );
            let _ = write!(out, "master_sync_in_progress:0\r\n");
            let _ = write!(out, "slave_repl_offset:{}\r\n", slave_repl_offset);
            let _ = write!(out, "slave_priority:-1\r\n");
            let _ = write!(out, "slave_read_only:1\r\n");
        }
    }

    fn repl_info_detail(&self, out: &mut String) {
        let st = self.state.lock();
        let now = Instant::now();

        // master line for the store with the stalest progress
        let mut pick: Option<(usize, u128)> = None;
        for i in 0..st.sync_meta.len() {
            let lag = now
                .saturating_duration_since(st.slave_pov[i].last_sync_time)
                .as_millis();
            if pick.map_or(true, |(_, best)| lag > best) {
                pick = Some((i, lag));
            }
        }
        if let Some((i, lag)) = pick {
            let meta = &st.sync_meta[i];
            let _ = write!(
                out,
                "master:ip={},port={},sync_from_id={},binlog_id={},repl_state={},sync_lag_ms={}\r\n",
                meta.sync_from_host,
                meta.sync_from_port,
                meta.sync_from_id,
                meta.binlog_id,
                meta.repl_state,
                lag
            );
        }

        // slave line for the most lagged subscriber
        let mut best: Option<(i64, String)> = None;
        for i in 0..st.push_status.len() {
            let Ok(handle) = self.seg_mgr.get_store(i as u32, LockMode::LockNone) else {
                return;
            };
            let Ok(highest) = handle.store.highest_binlog_id() else {
                return;
            };
            for (n, status) in st.push_status[i].values().enumerate() {
                let lag = highest as i64 - status.binlog_pos as i64;
                if best.as_ref().map_or(true, |(b, _)| lag > *b) {
                    let line = format!(
                        "slave{}:clientid={},is_running={},dest_store_id={},binlog_pos={},binlog_lag={},remote_host={},remote_port={}\r\n",
                        n,
                        status.client_id,
                        status.is_running as u8,
                        status.dst_store_id,
                        status.binlog_pos,
                        lag,
                        status.slave_listen_ip,
                        status.slave_listen_port
                    );
                    best = Some((lag, line));
                }
            }
        }
        if let Some((_, line)) = best {
            out.push_str(&line);
        }
    }

    /// Structured JSON view keyed by store id
    pub fn json_stats(&self) -> Value {
        let st = self.state.lock();
        let now = Instant::now();
        let mut root = Map::new();
        for i in 0..st.sync_meta.len() {
            let mut dest = Map::new();
            for status in st.push_status[i].values() {
                let remote = status
                    .client
                    .as_ref()
                    .map(|c| c.remote_repr())
                    .unwrap_or_else(|| "???".to_string());
                dest.insert(
                    format!("client_{}", status.client_id),
                    json!({
                        "is_running": status.is_running,
                        "dest_store_id": status.dst_store_id,
                        "binlog_pos": status.binlog_pos,
                        "remote_host": remote,
                    }),
                );
            }

            let meta = &st.sync_meta[i];
            let sync_lag_ms = now
                .saturating_duration_since(st.slave_pov[i].last_sync_time)
                .as_millis() as u64;
            root.insert(
                i.to_string(),
                json!({
                    "first_binlog": st.recycle[i].first_binlog_id,
                    "timestamp": st.recycle[i].timestamp,
                    "incr_paused": self.is_incr_paused(),
                    "sync_dest": Value::Object(dest),
                    "sync_source": format!(
                        "{}:{}:{}",
                        meta.sync_from_host, meta.sync_from_port, meta.sync_from_id
                    ),
                    "binlog_id": meta.binlog_id,
                    "repl_state": meta.repl_state.as_str(),
                    "last_sync_lag_ms": sync_lag_ms,
                }),
            );
        }
        Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{dummy_master, env_with, wait_until, MockProtocol};
    use crate::replication::ReplState;
    use crate::store::MIN_VALID_TXNID;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_info_master_role() {
        let env = env_with(4, Arc::new(MockProtocol::default()), |_| {});
        env.mgr.startup().unwrap();

        let info = env.mgr.repl_info();
        assert!(info.contains("role:master\r\n"), "info: {}", info);
        assert!(info.contains("connected_slaves:0\r\n"), "info: {}", info);
        assert!(!info.contains("master_host:"), "info: {}", info);
    }

    #[test]
    fn test_info_slave_role_and_source_fields() {
        let protocol = Arc::new(MockProtocol::default());
        protocol.set_full_sync_anchor(9);
        let env = env_with(2, protocol, |_| {});
        env.mgr.startup().unwrap();

        let master = dummy_master();
        env.mgr
            .change_repl_source(1, "127.0.0.1", master.port(), 1)
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            env.mgr.state.lock().sync_meta[1].repl_state == ReplState::Connected
        }));

        let info = env.mgr.repl_info();
        assert!(info.contains("role:slave\r\n"), "info: {}", info);
        assert!(info.contains("master_host:127.0.0.1\r\n"), "info: {}", info);
        assert!(
            info.contains(&format!("master_port:{}\r\n", master.port())),
            "info: {}",
            info
        );
        assert!(info.contains("slave_read_only:1\r\n"), "info: {}", info);
    }

    #[test]
    fn test_connected_slaves_reflects_last_store() {
        let env = env_with(2, Arc::new(MockProtocol::default()), |_| {});
        env.mgr.startup().unwrap();

        let client_a = env.network.create_blocking_client(1024);
        let client_b = env.network.create_blocking_client(1024);
        env.mgr
            .register_incr_sync(0, 0, 1, "10.0.0.8", 6390, client_a)
            .unwrap();
        env.mgr
            .register_incr_sync(0, 0, 2, "10.0.0.9", 6390, client_b)
            .unwrap();

        // the count is taken per store in a loop; the last store wins
        let info = env.mgr.repl_info();
        assert!(info.contains("connected_slaves:0\r\n"), "info: {}", info);

        let stats = env.mgr.json_stats();
        let dest = stats["0"]["sync_dest"].as_object().unwrap();
        assert_eq!(dest.len(), 2);
    }

    #[test]
    fn test_json_stats_shape() {
        let env = env_with(2, Arc::new(MockProtocol::default()), |_| {});
        env.mgr.startup().unwrap();

        let stats = env.mgr.json_stats();
        for key in ["0", "1"] {
            let per_store = &stats[key];
            assert_eq!(per_store["first_binlog"], MIN_VALID_TXNID);
            assert_eq!(per_store["incr_paused"], false);
            assert_eq!(per_store["repl_state"], "none");
            assert_eq!(per_store["sync_source"], ":0:0");
            assert!(per_store["sync_dest"].as_object().unwrap().is_empty());
        }

        env.mgr.set_incr_paused(true);
        assert_eq!(env.mgr.json_stats()["0"]["incr_paused"], true);
    }
}
