use std::sync::Mutex;

use async_trait::async_trait;
use qalog_core::models::{LogEntry, NewLogEntry};
use sqlx::PgPool;
use uuid::Uuid;

use crate::store::StoreError;

/// Append-only destination for enriched log rows.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: &NewLogEntry) -> Result<Uuid, StoreError>;
}

#[derive(Clone)]
pub struct PgLogSink {
    pool: PgPool,
}

impl PgLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogSink for PgLogSink {
    async fn append(&self, entry: &NewLogEntry) -> Result<Uuid, StoreError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO qa_logs
                (user_id, session_id, iteration, program, event_type, endpoint,
                 method, request_body, response_body, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(&entry.user_id)
        .bind(&entry.session_id)
        .bind(entry.iteration)
        .bind(&entry.program)
        .bind(entry.event_kind.as_str())
        .bind(&entry.endpoint)
        .bind(&entry.method)
        .bind(entry.request.as_ref().map(|b| b.to_stored()))
        .bind(entry.response.as_ref().map(|b| b.to_stored()))
        .bind(entry.status)
        .bind(entry.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

/// In-process sink, mainly for tests and dry runs.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, entry: &NewLogEntry) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let row = LogEntry {
            id,
            user_id: entry.user_id.clone(),
            session_id: entry.session_id.clone(),
            iteration: entry.iteration,
            program: entry.program.clone(),
            event_type: entry.event_kind.as_str().to_string(),
            endpoint: entry.endpoint.clone(),
            method: entry.method.clone(),
            request_body: entry.request.as_ref().map(|b| b.to_stored()),
            response_body: entry.response.as_ref().map(|b| b.to_stored()),
            status: entry.status,
            created_at: entry.created_at,
        };
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory log sink poisoned".into()))?
            .push(row);
        Ok(id)
    }
}
