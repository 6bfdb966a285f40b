use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Analyst annotation on one (program, session, iteration).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemarkEntry {
    pub program: String,
    pub session_id: String,
    pub iteration: i32,
    pub name: String,
    pub body: String,
    pub author: String,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
