use anyhow::Result;
use qalog_core::models::RemarkEntry;
use serde::Deserialize;
use sqlx::PgPool;

/// Longest remark name accepted.
const NAME_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, Deserialize)]
pub struct RemarkUpsert {
    pub program: String,
    pub session_id: String,
    pub iteration: i32,
    pub name: String,
    pub body: String,
    pub author: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemarkResolve {
    pub program: String,
    pub session_id: String,
    pub iteration: i32,
    pub resolved_by: String,
    #[serde(default = "default_resolved")]
    pub resolved: bool,
}

fn default_resolved() -> bool {
    true
}

impl RemarkUpsert {
    /// Reject remarks that cannot be shown on a dashboard.
    pub fn validate(&self) -> Result<(), String> {
        if self.program.trim().is_empty() || self.session_id.trim().is_empty() {
            return Err("program and session_id are required".to_string());
        }
        if self.iteration < 1 {
            return Err("iteration must be at least 1".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if self.name.chars().count() > NAME_MAX_CHARS {
            return Err(format!("name must be at most {} characters", NAME_MAX_CHARS));
        }
        if self.author.trim().is_empty() {
            return Err("author is required".to_string());
        }
        Ok(())
    }
}

const REMARK_COLUMNS: &str = "program, session_id, iteration, name, body, author, resolved, \
                              resolved_by, resolved_at, created_at, updated_at";

/// Create or replace the remark for (program, session, iteration). Editing a
/// remark reopens it.
pub async fn upsert_remark(pool: &PgPool, remark: &RemarkUpsert) -> Result<RemarkEntry> {
    let row = sqlx::query_as::<_, RemarkEntry>(&format!(
        r#"
        INSERT INTO qa_remarks (program, session_id, iteration, name, body, author)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (program, session_id, iteration)
        DO UPDATE SET
            name = EXCLUDED.name,
            body = EXCLUDED.body,
            author = EXCLUDED.author,
            resolved = false,
            resolved_by = NULL,
            resolved_at = NULL,
            updated_at = now()
        RETURNING {}
        "#,
        REMARK_COLUMNS
    ))
    .bind(remark.program.trim())
    .bind(remark.session_id.trim())
    .bind(remark.iteration)
    .bind(remark.name.trim())
    .bind(&remark.body)
    .bind(remark.author.trim())
    .fetch_one(pool)
    .await?;

    tracing::info!(
        program = %row.program,
        session_id = %row.session_id,
        iteration = row.iteration,
        author = %row.author,
        "Remark saved"
    );
    Ok(row)
}

/// Mark a remark resolved (or reopen it). `None` when no remark exists.
pub async fn resolve_remark(pool: &PgPool, req: &RemarkResolve) -> Result<Option<RemarkEntry>> {
    let row = sqlx::query_as::<_, RemarkEntry>(&format!(
        r#"
        UPDATE qa_remarks
        SET resolved = $4,
            resolved_by = CASE WHEN $4 THEN $5 ELSE NULL END,
            resolved_at = CASE WHEN $4 THEN now() ELSE NULL END,
            updated_at = now()
        WHERE program = $1 AND session_id = $2 AND iteration = $3
        RETURNING {}
        "#,
        REMARK_COLUMNS
    ))
    .bind(&req.program)
    .bind(&req.session_id)
    .bind(req.iteration)
    .bind(req.resolved)
    .bind(&req.resolved_by)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_remarks(
    pool: &PgPool,
    program: &str,
    session_id: Option<&str>,
) -> Result<Vec<RemarkEntry>> {
    let rows = sqlx::query_as::<_, RemarkEntry>(&format!(
        r#"
        SELECT {}
        FROM qa_remarks
        WHERE program = $1 AND ($2::text IS NULL OR session_id = $2)
        ORDER BY session_id, iteration
        "#,
        REMARK_COLUMNS
    ))
    .bind(program)
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
