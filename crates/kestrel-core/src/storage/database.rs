//! SQLite connection and schema migrations

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

pub type SharedDatabase = Arc<Database>;

const MIGRATIONS: &[&str] = &[
    // 1: prompts and plugin state
    "CREATE TABLE IF NOT EXISTS prompts (
         id TEXT PRIMARY KEY,
         user_id TEXT NOT NULL,
         status TEXT NOT NULL,
         body TEXT NOT NULL,
         created_at TEXT NOT NULL,
         updated_at TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_prompts_user ON prompts(user_id, created_at);
     CREATE TABLE IF NOT EXISTS plugin_state (
         user_id TEXT NOT NULL,
         plugin_id TEXT NOT NULL,
         record TEXT NOT NULL,
         updated_at TEXT NOT NULL,
         PRIMARY KEY (user_id, plugin_id)
     );",
];

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) and migrate the database at `path`
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Current schema version
    pub fn version(&self) -> Result<usize> {
        let version: i64 = self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version as usize)
    }

    fn migrate(&self) -> Result<()> {
        let current = self.version()?;
        let conn = self.conn();
        for (index, sql) in MIGRATIONS.iter().enumerate().skip(current) {
            let version = index + 1;
            conn.execute_batch(sql)
                .with_context(|| format!("applying migration {version}"))?;
            conn.pragma_update(None, "user_version", version as i64)?;
            tracing::info!(version, "Applied database migration");
        }
        Ok(())
    }
}
