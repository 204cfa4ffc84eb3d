use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::sessions::SessionRecord;
use crate::{GatewayStore, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct RequestRow {
    pub pk: i64,
    pub id: String,
    pub session_id: String,
    pub timestamp: u64,
    pub model: String,
    pub stream: bool,
    pub inbound_body: String,
    pub upstream_body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseRow {
    pub pk: i64,
    pub id: String,
    pub request_pk: i64,
    pub session_id: String,
    pub timestamp: u64,
    pub upstream_body: Option<String>,
    pub outbound_body: String,
    pub parent_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub finish_reason: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

/// Filters for the request audit listing. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session: SessionRecord,
    pub request_count: u64,
    pub response_count: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageStats {
    pub response_count: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub error_count: u64,
    pub average_duration_ms: u64,
}

const REQUEST_COLUMNS: &str =
    "pk, id, session_id, timestamp, model, stream, inbound_body, upstream_body";
const RESPONSE_COLUMNS: &str = "pk, id, request_pk, session_id, timestamp, upstream_body, \
     outbound_body, parent_id, prompt_tokens, completion_tokens, total_tokens, finish_reason, \
     error_message, duration_ms";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok(RequestRow {
        pk: row.get(0)?,
        id: row.get(1)?,
        session_id: row.get(2)?,
        timestamp: row.get(3)?,
        model: row.get(4)?,
        stream: row.get(5)?,
        inbound_body: row.get(6)?,
        upstream_body: row.get(7)?,
    })
}

fn response_from_row(row: &Row<'_>) -> rusqlite::Result<ResponseRow> {
    Ok(ResponseRow {
        pk: row.get(0)?,
        id: row.get(1)?,
        request_pk: row.get(2)?,
        session_id: row.get(3)?,
        timestamp: row.get(4)?,
        upstream_body: row.get(5)?,
        outbound_body: row.get(6)?,
        parent_id: row.get(7)?,
        prompt_tokens: row.get(8)?,
        completion_tokens: row.get(9)?,
        total_tokens: row.get(10)?,
        finish_reason: row.get(11)?,
        error_message: row.get(12)?,
        duration_ms: row.get(13)?,
    })
}

impl GatewayStore {
    pub fn list_sessions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, upstream_chat_id, parent_id, first_user_message, message_count, \
             created_at, last_accessed, expires_at FROM sessions \
             ORDER BY last_accessed DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = statement.query_map(params![limit as i64, offset as i64], |row| {
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
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Aggregated token totals and row counts for one session.
    pub fn session_stats(&self, id: &str, now_ms: u64) -> Result<Option<SessionStats>, StoreError> {
        let Some(session) = self.get_session(id, now_ms)? else {
            return Ok(None);
        };
        let conn = self.lock()?;
        let request_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM requests WHERE session_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let (response_count, prompt, completion, total, errors): (i64, i64, i64, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(prompt_tokens), 0), \
                 COALESCE(SUM(completion_tokens), 0), COALESCE(SUM(total_tokens), 0), \
                 COALESCE(SUM(error_message IS NOT NULL), 0) \
                 FROM responses WHERE session_id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )?;
        Ok(Some(SessionStats {
            session,
            request_count: request_count.max(0) as u64,
            response_count: response_count.max(0) as u64,
            prompt_tokens: prompt.max(0) as u64,
            completion_tokens: completion.max(0) as u64,
            total_tokens: total.max(0) as u64,
            error_count: errors.max(0) as u64,
        }))
    }

    pub fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<RequestRow>, StoreError> {
        let conn = self.lock()?;
        let mut sql = format!("SELECT {REQUEST_COLUMNS} FROM requests");
        let mut clauses: Vec<&str> = Vec::new();
        let mut bindings: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(session_id) = filter.session_id.as_deref() {
            clauses.push("session_id = ?");
            bindings.push(Box::new(session_id.to_string()));
        }
        if let Some(model) = filter.model.as_deref() {
            clauses.push("model = ?");
            bindings.push(Box::new(model.to_string()));
        }
        if let Some(start_ms) = filter.start_ms {
            clauses.push("timestamp >= ?");
            bindings.push(Box::new(start_ms as i64));
        }
        if let Some(end_ms) = filter.end_ms {
            clauses.push("timestamp <= ?");
            bindings.push(Box::new(end_ms as i64));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");
        bindings.push(Box::new(filter.limit as i64));
        bindings.push(Box::new(filter.offset as i64));

        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(
            rusqlite::params_from_iter(bindings.iter().map(|binding| binding.as_ref())),
            request_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn get_request(&self, id: &str) -> Result<Option<RequestRow>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
            params![id],
            request_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_responses(
        &self,
        session_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ResponseRow>, StoreError> {
        let conn = self.lock()?;
        let rows = match session_id {
            Some(session_id) => {
                let mut statement = conn.prepare(&format!(
                    "SELECT {RESPONSE_COLUMNS} FROM responses WHERE session_id = ?1 \
                     ORDER BY timestamp DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let mapped = statement.query_map(
                    params![session_id, limit as i64, offset as i64],
                    response_from_row,
                )?;
                mapped.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut statement = conn.prepare(&format!(
                    "SELECT {RESPONSE_COLUMNS} FROM responses \
                     ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let mapped = statement
                    .query_map(params![limit as i64, offset as i64], response_from_row)?;
                mapped.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    pub fn get_response(&self, id: &str) -> Result<Option<ResponseRow>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE id = ?1"),
            params![id],
            response_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// The response row written for a given request id, if the turn got far
    /// enough to produce one.
    pub fn response_for_request(
        &self,
        request_id: &str,
    ) -> Result<Option<ResponseRow>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT r.pk, r.id, r.request_pk, r.session_id, r.timestamp, r.upstream_body, \
             r.outbound_body, r.parent_id, r.prompt_tokens, r.completion_tokens, \
             r.total_tokens, r.finish_reason, r.error_message, r.duration_ms \
             FROM responses r JOIN requests q ON q.pk = r.request_pk WHERE q.id = ?1",
            params![request_id],
            response_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Token totals across all responses, optionally scoped to one session.
    pub fn usage_stats(&self, session_id: Option<&str>) -> Result<UsageStats, StoreError> {
        let conn = self.lock()?;
        let sql = match session_id {
            Some(_) => {
                "SELECT COUNT(*), COALESCE(SUM(prompt_tokens), 0), \
                 COALESCE(SUM(completion_tokens), 0), COALESCE(SUM(total_tokens), 0), \
                 COALESCE(SUM(error_message IS NOT NULL), 0), COALESCE(AVG(duration_ms), 0) \
                 FROM responses WHERE session_id = ?1"
            }
            None => {
                "SELECT COUNT(*), COALESCE(SUM(prompt_tokens), 0), \
                 COALESCE(SUM(completion_tokens), 0), COALESCE(SUM(total_tokens), 0), \
                 COALESCE(SUM(error_message IS NOT NULL), 0), COALESCE(AVG(duration_ms), 0) \
                 FROM responses"
            }
        };
        let map_row = |row: &Row<'_>| -> rusqlite::Result<UsageStats> {
            let response_count: i64 = row.get(0)?;
            let prompt: i64 = row.get(1)?;
            let completion: i64 = row.get(2)?;
            let total: i64 = row.get(3)?;
            let errors: i64 = row.get(4)?;
            let average_duration: f64 = row.get(5)?;
            Ok(UsageStats {
                response_count: response_count.max(0) as u64,
                prompt_tokens: prompt.max(0) as u64,
                completion_tokens: completion.max(0) as u64,
                total_tokens: total.max(0) as u64,
                error_count: errors.max(0) as u64,
                average_duration_ms: average_duration.max(0.0).round() as u64,
            })
        };
        let stats = match session_id {
            Some(session_id) => conn.query_row(sql, params![session_id], map_row)?,
            None => conn.query_row(sql, [], map_row)?,
        };
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::records::{NewRequestRecord, NewResponseRecord};
    use crate::test_support::open_temp_store;
    use crate::{conversation_fingerprint, GatewayStore, RequestFilter};

    const HOUR_MS: u64 = 3_600_000;

    fn seed_turn(
        store: &GatewayStore,
        session_id: &str,
        model: &str,
        at_ms: u64,
        tokens: (u64, u64),
        error: Option<&str>,
    ) -> String {
        let (request_id, request_pk) = store
            .log_request(
                NewRequestRecord {
                    session_id,
                    model,
                    stream: false,
                    inbound_body: r#"{"messages":[{"role":"user","content":"hi"}]}"#,
                    upstream_body: r#"{"chat_id":"chat-001"}"#,
                },
                at_ms,
            )
            .expect("log request");
        store
            .log_response(
                NewResponseRecord {
                    request_pk,
                    session_id,
                    upstream_body: None,
                    outbound_body: r#"{"id":"chatcmpl-x"}"#,
                    parent_id: Some("P1"),
                    prompt_tokens: tokens.0,
                    completion_tokens: tokens.1,
                    total_tokens: tokens.0 + tokens.1,
                    finish_reason: Some(if error.is_some() { "error" } else { "stop" }),
                    error_message: error,
                    duration_ms: 10,
                },
                at_ms + 5,
            )
            .expect("log response");
        request_id
    }

    #[test]
    fn request_filters_compose_and_paginate() {
        let (_dir, store) = open_temp_store(HOUR_MS);
        let a = conversation_fingerprint("a");
        let b = conversation_fingerprint("b");
        store.insert_session(&a, "chat-a", "a", 0).expect("insert");
        store.insert_session(&b, "chat-b", "b", 0).expect("insert");

        seed_turn(&store, &a, "qwen3-max", 1_000, (1, 1), None);
        seed_turn(&store, &a, "qwen3-coder", 2_000, (1, 1), None);
        seed_turn(&store, &b, "qwen3-max", 3_000, (1, 1), None);

        let all = store
            .list_requests(&RequestFilter {
                limit: 50,
                ..RequestFilter::default()
            })
            .expect("list");
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].timestamp, 3_000);

        let only_a = store
            .list_requests(&RequestFilter {
                session_id: Some(a.clone()),
                limit: 50,
                ..RequestFilter::default()
            })
            .expect("list");
        assert_eq!(only_a.len(), 2);

        let coder_in_window = store
            .list_requests(&RequestFilter {
                model: Some("qwen3-coder".to_string()),
                start_ms: Some(1_500),
                end_ms: Some(2_500),
                limit: 50,
                ..RequestFilter::default()
            })
            .expect("list");
        assert_eq!(coder_in_window.len(), 1);
        assert_eq!(coder_in_window[0].session_id, a);

        let paged = store
            .list_requests(&RequestFilter {
                limit: 1,
                offset: 1,
                ..RequestFilter::default()
            })
            .expect("list");
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].timestamp, 2_000);
    }

    #[test]
    fn usage_stats_aggregate_globally_and_per_session() {
        let (_dir, store) = open_temp_store(HOUR_MS);
        let a = conversation_fingerprint("a");
        let b = conversation_fingerprint("b");
        store.insert_session(&a, "chat-a", "a", 0).expect("insert");
        store.insert_session(&b, "chat-b", "b", 0).expect("insert");

        seed_turn(&store, &a, "qwen3-max", 1_000, (10, 20), None);
        seed_turn(&store, &a, "qwen3-max", 2_000, (5, 5), Some("timeout"));
        seed_turn(&store, &b, "qwen3-max", 3_000, (1, 1), None);

        let global = store.usage_stats(None).expect("stats");
        assert_eq!(global.response_count, 3);
        assert_eq!(global.total_tokens, 42);
        assert_eq!(global.error_count, 1);
        assert_eq!(global.average_duration_ms, 10);

        let scoped = store.usage_stats(Some(&a)).expect("stats");
        assert_eq!(scoped.response_count, 2);
        assert_eq!(scoped.total_tokens, 40);
    }

    #[test]
    fn session_stats_combine_row_counts_with_the_live_session() {
        let (_dir, store) = open_temp_store(HOUR_MS);
        let a = conversation_fingerprint("a");
        store.insert_session(&a, "chat-a", "a", 0).expect("insert");
        seed_turn(&store, &a, "qwen3-max", 1_000, (10, 20), None);

        let stats = store
            .session_stats(&a, 2_000)
            .expect("stats")
            .expect("session is live");
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.response_count, 1);
        assert_eq!(stats.total_tokens, 30);
        assert_eq!(stats.session.upstream_chat_id, "chat-a");

        assert!(store
            .session_stats("missing", 2_000)
            .expect("stats")
            .is_none());
    }

    #[test]
    fn list_sessions_orders_by_recency() {
        let (_dir, store) = open_temp_store(HOUR_MS);
        let a = conversation_fingerprint("a");
        let b = conversation_fingerprint("b");
        store.insert_session(&a, "chat-a", "a", 1_000).expect("insert");
        store.insert_session(&b, "chat-b", "b", 2_000).expect("insert");

        let sessions = store.list_sessions(50, 0).expect("list");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, b);
        assert_eq!(sessions[1].id, a);

        let paged = store.list_sessions(1, 1).expect("list");
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, a);
    }
}
