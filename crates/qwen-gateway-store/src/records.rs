use rusqlite::params;
use uuid::Uuid;

use crate::{GatewayStore, StoreError};

/// Audit row written immediately before the upstream call, so a crash
/// mid-turn still leaves a diagnostic trail. Never mutated afterwards.
#[derive(Debug, Clone, Copy)]
pub struct NewRequestRecord<'a> {
    pub session_id: &'a str,
    pub model: &'a str,
    pub stream: bool,
    /// Verbatim inbound OpenAI body.
    pub inbound_body: &'a str,
    /// Verbatim upstream envelope.
    pub upstream_body: &'a str,
}

/// Audit row written once per completed request, error rows included.
#[derive(Debug, Clone, Copy)]
pub struct NewResponseRecord<'a> {
    pub request_pk: i64,
    pub session_id: &'a str,
    /// Raw upstream reply; null in streaming mode.
    pub upstream_body: Option<&'a str>,
    pub outbound_body: &'a str,
    pub parent_id: Option<&'a str>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub finish_reason: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub duration_ms: u64,
}

impl GatewayStore {
    /// Appends a request row, returning its public id and the integer key
    /// the response row links back to.
    pub fn log_request(
        &self,
        record: NewRequestRecord<'_>,
        now_ms: u64,
    ) -> Result<(String, i64), StoreError> {
        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO requests (id, session_id, timestamp, model, stream, inbound_body, upstream_body) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                record.session_id,
                now_ms,
                record.model,
                record.stream,
                record.inbound_body,
                record.upstream_body,
            ],
        )?;
        Ok((id, conn.last_insert_rowid()))
    }

    /// Appends the response row for a logged request.
    pub fn log_response(
        &self,
        record: NewResponseRecord<'_>,
        now_ms: u64,
    ) -> Result<String, StoreError> {
        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO responses (id, request_pk, session_id, timestamp, upstream_body, \
             outbound_body, parent_id, prompt_tokens, completion_tokens, total_tokens, \
             finish_reason, error_message, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                record.request_pk,
                record.session_id,
                now_ms,
                record.upstream_body,
                record.outbound_body,
                record.parent_id,
                record.prompt_tokens,
                record.completion_tokens,
                record.total_tokens,
                record.finish_reason,
                record.error_message,
                record.duration_ms,
            ],
        )?;
        Ok(id)
    }
}
