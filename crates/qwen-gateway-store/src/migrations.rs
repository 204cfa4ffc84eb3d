use rusqlite::{params, Connection, OptionalExtension};

use qwen_gateway_core::current_unix_timestamp_ms;

use crate::StoreError;

/// One schema revision. `up` and `down` are full SQL batches; the runner
/// applies each pending revision inside its own transaction.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial schema",
    up: "
        CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            upstream_chat_id TEXT NOT NULL,
            parent_id TEXT,
            first_user_message TEXT NOT NULL,
            message_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            last_accessed INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX idx_sessions_expires_at ON sessions(expires_at);

        CREATE TABLE requests (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            timestamp INTEGER NOT NULL,
            model TEXT NOT NULL,
            stream INTEGER NOT NULL DEFAULT 0,
            inbound_body TEXT NOT NULL,
            upstream_body TEXT NOT NULL
        );
        CREATE INDEX idx_requests_session_timestamp ON requests(session_id, timestamp);

        CREATE TABLE responses (
            pk INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            request_pk INTEGER NOT NULL REFERENCES requests(pk) ON DELETE CASCADE,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            timestamp INTEGER NOT NULL,
            upstream_body TEXT,
            outbound_body TEXT NOT NULL,
            parent_id TEXT,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            finish_reason TEXT,
            error_message TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_responses_session_timestamp ON responses(session_id, timestamp);
    ",
    down: "
        DROP INDEX idx_responses_session_timestamp;
        DROP TABLE responses;
        DROP INDEX idx_requests_session_timestamp;
        DROP TABLE requests;
        DROP INDEX idx_sessions_expires_at;
        DROP TABLE sessions;
    ",
}];

const METADATA_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
";

pub(crate) fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    conn.execute_batch(METADATA_TABLE_SQL)?;
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|raw| raw.parse().ok()).unwrap_or(0))
}

/// Applies every migration newer than the stored schema version, one
/// transaction per revision. Any failure rolls the revision back and aborts
/// startup.
pub(crate) fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version = current_schema_version(conn)?;
    for migration in MIGRATIONS {
        if migration.version <= version {
            continue;
        }
        let tx = conn.transaction()?;
        let applied = tx.execute_batch(migration.up).and_then(|_| {
            tx.execute(
                "INSERT INTO metadata (key, value, updated_at) VALUES ('schema_version', ?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?1, updated_at = ?2",
                params![
                    migration.version.to_string(),
                    current_unix_timestamp_ms() as i64
                ],
            )
            .map(|_| ())
        });
        match applied {
            Ok(()) => {
                tx.commit()?;
                tracing::info!(
                    version = migration.version,
                    name = migration.name,
                    "applied schema migration"
                );
                version = migration.version;
            }
            Err(error) => {
                // Dropping the transaction rolls it back.
                return Err(StoreError::Migration {
                    version: migration.version,
                    message: error.to_string(),
                });
            }
        }
    }
    Ok(())
}
