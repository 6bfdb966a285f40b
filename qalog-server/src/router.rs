use chrono::Utc;
use qalog_core::ipc::{QaLogRequest, QaLogResponse};

use crate::app::AppState;
use crate::subsystems::status;

pub async fn handle_request(request: QaLogRequest, state: &AppState) -> QaLogResponse {
    match request {
        QaLogRequest::Ping => QaLogResponse::pong(),
        QaLogRequest::Health => match qalog_core::db::health_check(&state.pool).await {
            Ok(pg_ver) => QaLogResponse::ok(serde_json::json!({
                "postgresql": pg_ver,
                "status": "healthy"
            })),
            Err(e) => QaLogResponse::err(format!("DB Health Check failed: {}", e)),
        },
        QaLogRequest::Ingest {
            channel,
            payload,
            peer,
        } => match state.pipeline.ingest(channel, payload, peer.as_deref()).await {
            Ok(outcome) => match serde_json::to_value(&outcome) {
                Ok(data) => QaLogResponse::ok(data),
                Err(e) => QaLogResponse::err(format!("Serialization error: {}", e)),
            },
            Err(e) => QaLogResponse::err(e.to_string()),
        },
        QaLogRequest::Status { program } => {
            match status::program_status(
                state.store.as_ref(),
                &program,
                &state.config.status,
                Utc::now(),
            )
            .await
            {
                Ok(s) => match serde_json::to_value(&s) {
                    Ok(data) => QaLogResponse::ok(data),
                    Err(e) => QaLogResponse::err(format!("Serialization error: {}", e)),
                },
                Err(e) => QaLogResponse::err(e.to_string()),
            }
        }
    }
}
