//! Durable gateway state: conversation sessions keyed by fingerprint, the
//! append-only request/response audit log, and the read queries behind the
//! audit endpoints. Backed by a single embedded SQLite file in WAL mode so
//! audit readers never block request-path writers.
mod fingerprint;
mod migrations;
mod queries;
mod records;
mod sessions;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use thiserror::Error;

pub use fingerprint::conversation_fingerprint;
pub use migrations::{Migration, MIGRATIONS};
pub use queries::{RequestFilter, RequestRow, ResponseRow, SessionStats, UsageStats};
pub use records::{NewRequestRecord, NewResponseRecord};
pub use sessions::SessionRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("migration {version} failed: {message}")]
    Migration { version: i64, message: String },
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Handle over the embedded database. Cheap to clone; all clones share one
/// connection guarded by a mutex (row writes are sub-millisecond, WAL keeps
/// readers unblocked).
#[derive(Debug, Clone)]
pub struct GatewayStore {
    conn: Arc<Mutex<Connection>>,
    session_timeout_ms: u64,
}

impl GatewayStore {
    /// Opens (or creates) the database at `path` and applies any pending
    /// migrations. A migration failure aborts startup.
    pub fn open(path: &Path, session_timeout_ms: u64) -> Result<Self, StoreError> {
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            session_timeout_ms,
        })
    }

    pub fn session_timeout_ms(&self) -> u64 {
        self.session_timeout_ms
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Current schema version from the metadata table.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        migrations::current_schema_version(&conn)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::GatewayStore;

    pub(crate) fn open_temp_store(timeout_ms: u64) -> (tempfile::TempDir, GatewayStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            GatewayStore::open(&dir.path().join("gateway.db"), timeout_ms).expect("open store");
        (dir, store)
    }
}
