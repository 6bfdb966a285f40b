//! Yearly archive: move one calendar year of log rows out of the live table
//! into `qa_logs_{year}`.

use anyhow::{bail, Result};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::Serialize;
use sqlx::PgPool;

pub const MIN_ARCHIVE_YEAR: i32 = 2000;
pub const MAX_ARCHIVE_YEAR: i32 = 2100;

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub year: i32,
    pub table: String,
    pub rows_archived: u64,
}

pub fn archive_table_name(year: i32) -> Result<String> {
    if !(MIN_ARCHIVE_YEAR..=MAX_ARCHIVE_YEAR).contains(&year) {
        bail!(
            "year must be between {} and {}, got {}",
            MIN_ARCHIVE_YEAR,
            MAX_ARCHIVE_YEAR,
            year
        );
    }
    Ok(format!("qa_logs_{}", year))
}

/// `[Jan 1 year, Jan 1 year+1)` in the logging server's time zone.
pub fn year_bounds(year: i32, offset: &FixedOffset) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = offset.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()?;
    let end = offset.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single()?;
    Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

pub async fn archive_year(pool: &PgPool, year: i32, offset: &FixedOffset) -> Result<ArchiveReport> {
    let table = archive_table_name(year)?;
    let Some((start, end)) = year_bounds(year, offset) else {
        bail!("cannot compute bounds for year {}", year);
    };

    let mut tx = pool.begin().await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (LIKE qa_logs INCLUDING ALL)",
        table
    ))
    .execute(&mut *tx)
    .await?;

    let result = sqlx::query(&format!(
        r#"
        WITH moved AS (
            DELETE FROM qa_logs
            WHERE created_at >= $1 AND created_at < $2
            RETURNING *
        )
        INSERT INTO {} SELECT * FROM moved
        "#,
        table
    ))
    .bind(start)
    .bind(end)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let rows_archived = result.rows_affected();
    tracing::info!(year, table = %table, rows = rows_archived, "Archived log rows");

    Ok(ArchiveReport {
        year,
        table,
        rows_archived,
    })
}
