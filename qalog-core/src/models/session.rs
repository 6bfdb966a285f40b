use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-partition iteration state. One row per (user, session); the row with
/// the highest session number is the live one, older rows are history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionState {
    pub user_id: String,
    pub program: String,
    pub session_id: String,
    pub session_number: i64,
    pub iteration: i32,
    pub last_bucket: Option<DateTime<Utc>>,
    pub sub_state: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    /// A fresh session with no iteration assigned yet.
    pub fn fresh(user_id: &str, program: &str, session_number: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            program: program.to_string(),
            session_id: session_id_for(program, session_number),
            session_number,
            iteration: 0,
            last_bucket: None,
            sub_state: None,
            updated_at: Utc::now(),
        }
    }
}

/// `{program}_Test_{n}`
pub fn session_id_for(program: &str, session_number: i64) -> String {
    format!("{}_Test_{}", program, session_number)
}
