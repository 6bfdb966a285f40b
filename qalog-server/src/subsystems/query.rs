//! Read side for dashboards: programs → sessions → iterations → logs, plus
//! duplicate-error grouping.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Result;
use chrono::{DateTime, Utc};
use qalog_core::models::{Body, LogEntry};
use regex::Regex;
use serde::Serialize;
use sqlx::PgPool;

/// Longest message kept as a group's sample.
const SAMPLE_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProgramSummary {
    pub program: String,
    pub session_count: i64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SessionSummary {
    pub session_id: String,
    pub session_number: i64,
    pub user_id: String,
    pub iteration_count: i32,
    pub log_count: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IterationSummary {
    pub iteration: i32,
    pub log_count: i64,
    pub error_count: i64,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
    pub remark_name: Option<String>,
    pub remark_resolved: Option<bool>,
}

/// A set of backend errors that differ only in volatile details.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorGroup {
    pub signature: String,
    pub endpoint: Option<String>,
    pub event_type: String,
    pub occurrences: usize,
    pub first_iteration: i32,
    pub last_iteration: i32,
    pub sample: String,
}

pub async fn list_programs(pool: &PgPool) -> Result<Vec<ProgramSummary>> {
    let rows = sqlx::query_as::<_, ProgramSummary>(
        r#"
        SELECT program,
               COUNT(*)::bigint AS session_count,
               MAX(updated_at) AS last_activity
        FROM qa_session_state
        GROUP BY program
        ORDER BY MAX(updated_at) DESC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_sessions(pool: &PgPool, program: &str) -> Result<Vec<SessionSummary>> {
    let rows = sqlx::query_as::<_, SessionSummary>(
        r#"
        SELECT s.session_id,
               s.session_number,
               s.user_id,
               s.iteration AS iteration_count,
               COALESCE(l.log_count, 0)::bigint AS log_count,
               s.updated_at
        FROM qa_session_state s
        LEFT JOIN (
            SELECT session_id, COUNT(*) AS log_count
            FROM qa_logs
            WHERE program = $1
            GROUP BY session_id
        ) l ON l.session_id = s.session_id
        WHERE s.program = $1
        ORDER BY s.session_number DESC
        "#,
    )
    .bind(program)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Iterations of a session that have logs or a remark.
pub async fn list_iterations(
    pool: &PgPool,
    program: &str,
    session_id: &str,
) -> Result<Vec<IterationSummary>> {
    let rows = sqlx::query_as::<_, IterationSummary>(
        r#"
        WITH logs AS (
            SELECT iteration,
                   COUNT(*)::bigint AS log_count,
                   COUNT(*) FILTER (
                       WHERE event_type IN ('backend-error', 'backend-fatal')
                   )::bigint AS error_count,
                   MIN(created_at) AS first_at,
                   MAX(created_at) AS last_at
            FROM qa_logs
            WHERE program = $1 AND session_id = $2
            GROUP BY iteration
        )
        SELECT COALESCE(l.iteration, r.iteration) AS iteration,
               COALESCE(l.log_count, 0)::bigint AS log_count,
               COALESCE(l.error_count, 0)::bigint AS error_count,
               l.first_at,
               l.last_at,
               r.name AS remark_name,
               r.resolved AS remark_resolved
        FROM logs l
        FULL OUTER JOIN (
            SELECT iteration, name, resolved
            FROM qa_remarks
            WHERE program = $1 AND session_id = $2
        ) r ON r.iteration = l.iteration
        ORDER BY 1
        "#,
    )
    .bind(program)
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_logs(
    pool: &PgPool,
    program: &str,
    session_id: &str,
    iteration: i32,
) -> Result<Vec<LogEntry>> {
    let rows = sqlx::query_as::<_, LogEntry>(
        r#"
        SELECT id, user_id, session_id, iteration, program, event_type, endpoint,
               method, request_body, response_body, status, created_at
        FROM qa_logs
        WHERE program = $1 AND session_id = $2 AND iteration = $3
        ORDER BY created_at, id
        "#,
    )
    .bind(program)
    .bind(session_id)
    .bind(iteration)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn grouped_errors(pool: &PgPool, program: &str, session_id: &str) -> Result<Vec<ErrorGroup>> {
    let rows = sqlx::query_as::<_, LogEntry>(
        r#"
        SELECT id, user_id, session_id, iteration, program, event_type, endpoint,
               method, request_body, response_body, status, created_at
        FROM qa_logs
        WHERE program = $1 AND session_id = $2
          AND event_type IN ('backend-error', 'backend-fatal')
        ORDER BY created_at, id
        "#,
    )
    .bind(program)
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(group_errors(&rows))
}

/// Group error rows by (event type, endpoint, normalized message), keeping
/// first-seen order.
pub fn group_errors(rows: &[LogEntry]) -> Vec<ErrorGroup> {
    let mut groups: Vec<ErrorGroup> = Vec::new();
    let mut index: HashMap<(String, Option<String>, String), usize> = HashMap::new();

    for row in rows.iter().filter(|r| r.kind().is_error()) {
        let message = error_message(row);
        let signature = error_signature(&message);
        let key = (row.event_type.clone(), row.endpoint.clone(), signature.clone());

        match index.get(&key) {
            Some(&i) => {
                let group = &mut groups[i];
                group.occurrences += 1;
                group.first_iteration = group.first_iteration.min(row.iteration);
                group.last_iteration = group.last_iteration.max(row.iteration);
            }
            None => {
                index.insert(key, groups.len());
                groups.push(ErrorGroup {
                    signature,
                    endpoint: row.endpoint.clone(),
                    event_type: row.event_type.clone(),
                    occurrences: 1,
                    first_iteration: row.iteration,
                    last_iteration: row.iteration,
                    sample: message.chars().take(SAMPLE_MAX_CHARS).collect(),
                });
            }
        }
    }
    groups
}

/// The human-readable part of an error row: a `message` field when the
/// response is structured, otherwise the raw response text.
fn error_message(row: &LogEntry) -> String {
    match row.response() {
        Some(Body::Json(v)) => v
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| v.to_string()),
        Some(Body::Text(s)) => s,
        None => String::new(),
    }
}

fn normalizers() -> &'static [(Regex, &'static str)] {
    static NORMALIZERS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    NORMALIZERS.get_or_init(|| {
        [
            (r"0x[0-9a-fA-F]+", "0x#"),
            (r#""[^"]*""#, "\"?\""),
            (r"'[^']*'", "'?'"),
            (r"\d+", "#"),
            (r"\s+", " "),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
        .collect()
    })
}

/// Strip numbers, quoted values and addresses so repeats of one error share
/// a signature.
pub fn error_signature(message: &str) -> String {
    let mut signature = message.trim().to_string();
    for (re, replacement) in normalizers() {
        signature = re.replace_all(&signature, *replacement).into_owned();
    }
    signature
}
