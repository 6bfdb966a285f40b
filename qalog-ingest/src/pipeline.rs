//! Ingestion pipeline: payload → identity → iteration → log row.
//!
//! Logging is best effort. Events without a usable timestamp, or whose
//! assignment times out, are dropped and reported as such rather than as
//! errors, so the instrumented application never sees its own logging fail.

use std::sync::Arc;

use qalog_core::ipc::Channel;
use qalog_core::models::{EventKind, NewLogEntry};
use qalog_core::{IdentityResolver, RawIdentity};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::bucket::parse_timestamp;
use crate::engine::{AssignError, IterationEngine, Outcome};
use crate::payload::IngestPayload;
use crate::sink::LogSink;
use crate::store::StoreError;

/// Program name used when a hook does not send one.
pub const DEFAULT_PROGRAM: &str = "default";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Identity could not be resolved to an authorized user")]
    IdentityUnresolved,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    MissingTimestamp,
    InvalidTimestamp,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestOutcome {
    Stored {
        id: Uuid,
        user_id: String,
        session_id: String,
        iteration: i32,
        outcome: Outcome,
    },
    Dropped {
        reason: DropReason,
    },
}

pub struct IngestPipeline {
    resolver: IdentityResolver,
    engine: IterationEngine,
    sink: Arc<dyn LogSink>,
}

impl IngestPipeline {
    pub fn new(resolver: IdentityResolver, engine: IterationEngine, sink: Arc<dyn LogSink>) -> Self {
        Self {
            resolver,
            engine,
            sink,
        }
    }

    pub fn engine(&self) -> &IterationEngine {
        &self.engine
    }

    /// Ingest one hook payload. `peer` is the caller's network address, used
    /// to identify backend hooks that send no `device_name`.
    pub async fn ingest(
        &self,
        channel: Channel,
        payload: Value,
        peer: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let payload = IngestPayload::from_value(payload).map_err(IngestError::Malformed)?;

        let user_id = match channel {
            Channel::Frontend => {
                let raw_user = payload.user_id();
                let user_id = self.resolver.resolve(&RawIdentity::Frontend {
                    user_id: raw_user.as_deref(),
                });
                if self.resolver.is_guest(&user_id) {
                    return Err(IngestError::IdentityUnresolved);
                }
                user_id
            }
            Channel::Backend => self.resolver.resolve(&RawIdentity::Backend {
                device_name: payload.device_name.as_deref(),
                peer,
            }),
        };

        let Some(raw_ts) = payload.timestamp() else {
            tracing::warn!(user = %user_id, "Dropping event without timestamp");
            return Ok(IngestOutcome::Dropped {
                reason: DropReason::MissingTimestamp,
            });
        };
        let Some(ts) = parse_timestamp(&raw_ts, &self.engine.policy().local_offset) else {
            tracing::warn!(user = %user_id, timestamp = %raw_ts, "Dropping event with invalid timestamp");
            return Ok(IngestOutcome::Dropped {
                reason: DropReason::InvalidTimestamp,
            });
        };

        let program = payload.program().unwrap_or(DEFAULT_PROGRAM).to_string();

        let assignment = match self.engine.assign_at(&program, &user_id, ts).await {
            Ok(a) => a,
            Err(AssignError::Timeout(_)) => {
                return Ok(IngestOutcome::Dropped {
                    reason: DropReason::Timeout,
                })
            }
            Err(AssignError::InvalidTimestamp(_)) => {
                return Ok(IngestOutcome::Dropped {
                    reason: DropReason::InvalidTimestamp,
                })
            }
            Err(AssignError::Store(e)) => {
                tracing::error!(program = %program, user = %user_id, error = %e, "Iteration assignment failed");
                return Err(e.into());
            }
        };

        let default_kind = match channel {
            Channel::Frontend => EventKind::FrontendIo,
            Channel::Backend => EventKind::BackendResponse,
        };

        let entry = NewLogEntry {
            user_id: user_id.clone(),
            session_id: assignment.session_id.clone(),
            iteration: assignment.iteration,
            program,
            event_kind: payload.kind.unwrap_or(default_kind),
            endpoint: payload.endpoint.clone(),
            method: payload.method.clone(),
            request: payload.request.clone(),
            response: payload.response.clone(),
            status: payload.status_code(),
            created_at: ts,
        };

        let id = self.sink.append(&entry).await.map_err(|e| {
            tracing::error!(session_id = %entry.session_id, error = %e, "Failed to persist log entry");
            e
        })?;

        Ok(IngestOutcome::Stored {
            id,
            user_id,
            session_id: assignment.session_id,
            iteration: assignment.iteration,
            outcome: assignment.outcome,
        })
    }
}
