//! Live tail of a program's session/iteration sequence, polled by dashboards.

use chrono::{DateTime, Duration, Utc};
use qalog_core::config::StatusConfig;
use qalog_ingest::{SessionStateStore, StoreError};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramStatus {
    pub iteration: i32,
    pub active: bool,
    pub latest_iteration: i32,
    pub latest_session: Option<String>,
}

impl ProgramStatus {
    fn idle() -> Self {
        Self {
            iteration: 0,
            active: false,
            latest_iteration: 0,
            latest_session: None,
        }
    }
}

/// True when the last assigned bucket lies within `window_seconds` of `now`.
pub fn is_active(last_bucket: Option<DateTime<Utc>>, now: DateTime<Utc>, window_seconds: i64) -> bool {
    match last_bucket {
        Some(bucket) => now.signed_duration_since(bucket) <= Duration::seconds(window_seconds),
        None => false,
    }
}

pub async fn program_status(
    store: &dyn SessionStateStore,
    program: &str,
    config: &StatusConfig,
    now: DateTime<Utc>,
) -> Result<ProgramStatus, StoreError> {
    let Some(state) = store.latest_for_program(program).await? else {
        return Ok(ProgramStatus::idle());
    };

    Ok(ProgramStatus {
        iteration: state.iteration,
        active: is_active(state.last_bucket, now, config.active_window_seconds),
        latest_iteration: state.iteration,
        latest_session: Some(state.session_id),
    })
}
