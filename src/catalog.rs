//! Replication Catalog
//!
//! Durable persistence for per-store replication metadata, backed by
//! SQLite. Every durable mutation of a store's replication state goes
//! through [`Catalog::set_store_meta`] before the in-memory copy is
//! updated.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::replication::{ReplState, StoreMeta};

/// SQLite-backed catalog of replication metadata
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Create or open the catalog database under `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("catalog.db"))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                id INTEGER PRIMARY KEY,
                sync_from_host TEXT NOT NULL,
                sync_from_port INTEGER NOT NULL,
                sync_from_id INTEGER NOT NULL,
                repl_state TEXT NOT NULL,
                binlog_id INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Load one store's replication metadata; `Error::NotFound` when absent
    pub fn store_meta(&self, store_id: u32) -> Result<StoreMeta> {
        let conn = self.conn.lock();
        let meta = conn.query_row(
            r#"
            SELECT id, sync_from_host, sync_from_port, sync_from_id,
                   repl_state, binlog_id
            FROM store_meta WHERE id = ?1
            "#,
            params![store_id],
            |row| {
                let state: String = row.get(4)?;
                let binlog_id: i64 = row.get(5)?;
                Ok((
                    StoreMeta {
                        id: row.get(0)?,
                        sync_from_host: row.get(1)?,
                        sync_from_port: row.get::<_, u16>(2)?,
                        sync_from_id: row.get(3)?,
                        repl_state: ReplState::None,
                        binlog_id: binlog_id as u64,
                    },
                    state,
                ))
            },
        )?;
        let (mut out, state) = meta;
        out.repl_state = state.parse()?;
        Ok(out)
    }

    /// Upsert one store's replication metadata
    pub fn set_store_meta(&self, meta: &StoreMeta) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO store_meta
                (id, sync_from_host, sync_from_port, sync_from_id,
                 repl_state, binlog_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                sync_from_host = ?2,
                sync_from_port = ?3,
                sync_from_id = ?4,
                repl_state = ?5,
                binlog_id = ?6,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                meta.id,
                meta.sync_from_host,
                meta.sync_from_port,
                meta.sync_from_id,
                meta.repl_state.as_str(),
                meta.binlog_id as i64,
            ],
        )?;
        Ok(())
    }
}
