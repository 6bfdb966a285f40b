use async_trait::async_trait;
use qalog_core::models::SessionState;
use sqlx::{Acquire, PgPool, Postgres, Transaction};

use super::{SessionStateStore, StateTxn, StoreError};

const SESSION_ID_CONSTRAINT: &str = "qa_session_state_program_session_key";
const PRIMARY_KEY_CONSTRAINT: &str = "qa_session_state_pkey";

const SELECT_STATE: &str = r#"
    SELECT user_id, program, session_id, session_number, iteration,
           last_bucket, sub_state, updated_at
    FROM qa_session_state
"#;

/// PostgreSQL store. A partition's critical section is one transaction
/// holding a transaction-scoped advisory lock on the partition key.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Advisory lock key text for a partition. The unit separator keeps
/// ("a_b", "c") and ("a", "b_c") apart.
fn partition_key(user_id: &str, program: &str) -> String {
    format!("{}\u{1f}{}", user_id, program)
}

struct PgStateTxn {
    tx: Transaction<'static, Postgres>,
    user_id: String,
    program: String,
}

#[async_trait]
impl StateTxn for PgStateTxn {
    async fn load(&mut self) -> Result<Option<SessionState>, StoreError> {
        let state = sqlx::query_as::<_, SessionState>(&format!(
            "{} WHERE user_id = $1 AND program = $2 ORDER BY session_number DESC LIMIT 1",
            SELECT_STATE
        ))
        .bind(&self.user_id)
        .bind(&self.program)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(state)
    }

    async fn next_session_number(&mut self) -> Result<i64, StoreError> {
        // The counter row lock is held until commit, which serializes
        // concurrent rollovers for the same program across partitions.
        let number: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO qa_session_counters (program, last_number)
            VALUES ($1, (SELECT COUNT(*) FROM qa_session_state WHERE program = $1) + 1)
            ON CONFLICT (program)
            DO UPDATE SET last_number = qa_session_counters.last_number + 1
            RETURNING last_number
            "#,
        )
        .bind(&self.program)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(number)
    }

    async fn upsert(&mut self, state: &SessionState) -> Result<(), StoreError> {
        // Savepoint so a unique violation leaves the outer transaction usable.
        let mut savepoint = (&mut self.tx).begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO qa_session_state
                (user_id, program, session_id, session_number, iteration,
                 last_bucket, sub_state, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, clock_timestamp())
            ON CONFLICT (user_id, session_id)
            DO UPDATE SET
                iteration = EXCLUDED.iteration,
                last_bucket = EXCLUDED.last_bucket,
                sub_state = EXCLUDED.sub_state,
                updated_at = clock_timestamp()
            "#,
        )
        .bind(&state.user_id)
        .bind(&state.program)
        .bind(&state.session_id)
        .bind(state.session_number)
        .bind(state.iteration)
        .bind(state.last_bucket)
        .bind(&state.sub_state)
        .execute(&mut *savepoint)
        .await;

        finish_savepoint(savepoint, result, state, &[SESSION_ID_CONSTRAINT]).await
    }

    async fn create(&mut self, state: &SessionState) -> Result<(), StoreError> {
        let mut savepoint = (&mut self.tx).begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO qa_session_state
                (user_id, program, session_id, session_number, iteration,
                 last_bucket, sub_state, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, clock_timestamp())
            "#,
        )
        .bind(&state.user_id)
        .bind(&state.program)
        .bind(&state.session_id)
        .bind(state.session_number)
        .bind(state.iteration)
        .bind(state.last_bucket)
        .bind(&state.sub_state)
        .execute(&mut *savepoint)
        .await;

        finish_savepoint(
            savepoint,
            result,
            state,
            &[SESSION_ID_CONSTRAINT, PRIMARY_KEY_CONSTRAINT],
        )
        .await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Release the savepoint on success. A unique violation on one of
/// `constraints` rolls it back and becomes [`StoreError::Collision`].
async fn finish_savepoint(
    savepoint: Transaction<'_, Postgres>,
    result: Result<sqlx::postgres::PgQueryResult, sqlx::Error>,
    state: &SessionState,
    constraints: &[&str],
) -> Result<(), StoreError> {
    match result {
        Ok(_) => {
            savepoint.commit().await?;
            Ok(())
        }
        Err(sqlx::Error::Database(db))
            if db.is_unique_violation()
                && db.constraint().is_some_and(|c| constraints.contains(&c)) =>
        {
            savepoint.rollback().await?;
            Err(StoreError::Collision {
                program: state.program.clone(),
                session_id: state.session_id.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SessionStateStore for PgSessionStore {
    async fn begin(&self, user_id: &str, program: &str) -> Result<Box<dyn StateTxn>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(partition_key(user_id, program))
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgStateTxn {
            tx,
            user_id: user_id.to_string(),
            program: program.to_string(),
        }))
    }

    async fn get(&self, user_id: &str, program: &str) -> Result<Option<SessionState>, StoreError> {
        let state = sqlx::query_as::<_, SessionState>(&format!(
            "{} WHERE user_id = $1 AND program = $2 ORDER BY session_number DESC LIMIT 1",
            SELECT_STATE
        ))
        .bind(user_id)
        .bind(program)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    async fn latest_for_program(&self, program: &str) -> Result<Option<SessionState>, StoreError> {
        let state = sqlx::query_as::<_, SessionState>(&format!(
            "{} WHERE program = $1 ORDER BY updated_at DESC, session_number DESC LIMIT 1",
            SELECT_STATE
        ))
        .bind(program)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    async fn count_sessions(&self, program: &str) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*)::bigint FROM qa_session_state WHERE program = $1")
                .bind(program)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
