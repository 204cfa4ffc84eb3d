use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::{GatewayStore, StoreError};

/// One conversation's link to its upstream chat. `parent_id` is the cursor
/// into the upstream message chain: null exactly until the first reply, then
/// always the `parent_id` extracted from the latest reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub upstream_chat_id: String,
    pub parent_id: Option<String>,
    pub first_user_message: String,
    pub message_count: u64,
    pub created_at: u64,
    pub last_accessed: u64,
    pub expires_at: u64,
}

const SESSION_COLUMNS: &str = "id, upstream_chat_id, parent_id, first_user_message, \
     message_count, created_at, last_accessed, expires_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        upstream_chat_id: row.get(1)?,
        parent_id: row.get(2)?,
        first_user_message: row.get(3)?,
        message_count: row.get(4)?,
        created_at: row.get(5)?,
        last_accessed: row.get(6)?,
        expires_at: row.get(7)?,
    })
}

impl GatewayStore {
    /// Read-through lookup. An expired row is deleted on sight and reported
    /// as absent; a live row has its access window extended.
    pub fn get_session(&self, id: &str, now_ms: u64) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                session_from_row,
            )
            .optional()?;
        let Some(mut record) = record else {
            return Ok(None);
        };
        if record.expires_at <= now_ms {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            tracing::debug!(session_id = id, "dropped expired session on read");
            return Ok(None);
        }
        let expires_at = now_ms + self.session_timeout_ms;
        conn.execute(
            "UPDATE sessions SET last_accessed = ?1, expires_at = ?2 WHERE id = ?3",
            params![now_ms, expires_at, id],
        )?;
        record.last_accessed = now_ms;
        record.expires_at = expires_at;
        Ok(Some(record))
    }

    /// Creates the session row for a fresh conversation. Two requests can
    /// race here with the same fingerprint; the PRIMARY KEY settles it and
    /// the loser reads back the winning row.
    pub fn insert_session(
        &self,
        id: &str,
        upstream_chat_id: &str,
        first_user_message: &str,
        now_ms: u64,
    ) -> Result<SessionRecord, StoreError> {
        let conn = self.lock()?;
        let expires_at = now_ms + self.session_timeout_ms;
        let inserted = conn.execute(
            "INSERT INTO sessions (id, upstream_chat_id, parent_id, first_user_message, \
             message_count, created_at, last_accessed, expires_at) \
             VALUES (?1, ?2, NULL, ?3, 0, ?4, ?4, ?5)",
            params![id, upstream_chat_id, first_user_message, now_ms, expires_at],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(error, _))
                if error.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                tracing::debug!(session_id = id, "lost session-creation race, reading winner");
            }
            Err(error) => return Err(error.into()),
        }
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id],
            session_from_row,
        )
        .map_err(StoreError::from)
    }

    pub fn touch_session(&self, id: &str, now_ms: u64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let expires_at = now_ms + self.session_timeout_ms;
        let updated = conn.execute(
            "UPDATE sessions SET last_accessed = ?1, expires_at = ?2 WHERE id = ?3",
            params![now_ms, expires_at, id],
        )?;
        Ok(updated > 0)
    }

    /// Advances the parent cursor after a successful reply and counts the
    /// completed turn.
    pub fn update_session_parent(
        &self,
        id: &str,
        parent_id: &str,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let expires_at = now_ms + self.session_timeout_ms;
        let updated = conn.execute(
            "UPDATE sessions SET parent_id = ?1, message_count = message_count + 1, \
             last_accessed = ?2, expires_at = ?3 WHERE id = ?4",
            params![parent_id, now_ms, expires_at, id],
        )?;
        Ok(updated > 0)
    }

    /// Removes the session; request and response rows cascade.
    pub fn delete_session(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Deletes every session whose access window has lapsed.
    pub fn sweep_expired_sessions(&self, now_ms: u64) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![now_ms],
        )?;
        Ok(deleted)
    }

    pub fn count_sessions(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}
