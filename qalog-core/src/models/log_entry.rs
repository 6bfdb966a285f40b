use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Body;

/// Kind of captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    FrontendIo,
    BackendResponse,
    BackendError,
    BackendFatal,
    #[serde(other)]
    Other,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FrontendIo => "frontend-io",
            EventKind::BackendResponse => "backend-response",
            EventKind::BackendError => "backend-error",
            EventKind::BackendFatal => "backend-fatal",
            EventKind::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "frontend-io" => EventKind::FrontendIo,
            "backend-response" => EventKind::BackendResponse,
            "backend-error" => EventKind::BackendError,
            "backend-fatal" => EventKind::BackendFatal,
            _ => EventKind::Other,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EventKind::BackendError | EventKind::BackendFatal)
    }
}

/// Log row ready to be written; session and iteration already decided.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewLogEntry {
    pub user_id: String,
    pub session_id: String,
    pub iteration: i32,
    pub program: String,
    pub event_kind: EventKind,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub request: Option<Body>,
    pub response: Option<Body>,
    pub status: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Persisted log row. Bodies stay as stored text.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LogEntry {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub iteration: i32,
    pub program: String,
    pub event_type: String,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub status: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    pub fn request(&self) -> Option<Body> {
        self.request_body.as_deref().map(Body::from_stored)
    }

    pub fn response(&self) -> Option<Body> {
        self.response_body.as_deref().map(Body::from_stored)
    }
}
