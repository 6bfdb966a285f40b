//! Session State Store contract.
//!
//! Every read-modify-write of a partition's iteration state happens inside a
//! [`StateTxn`]: `begin` hands out exclusive access to one (user, program)
//! partition, and nothing the transaction stages becomes visible until
//! `commit`. Dropping the handle discards staged writes.

mod memory;
mod postgres;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

use async_trait::async_trait;
use qalog_core::models::SessionState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Session id {session_id} already exists for program {program}")]
    Collision { program: String, session_id: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Exclusive handle on one (user, program) partition.
#[async_trait]
pub trait StateTxn: Send {
    /// Live state for the partition: the row with the highest session number.
    async fn load(&mut self) -> Result<Option<SessionState>, StoreError>;

    /// Reserve the next session number for the partition's program. Numbers
    /// are never handed out twice, even across partitions of the same program.
    async fn next_session_number(&mut self) -> Result<i64, StoreError>;

    /// Create-or-update keyed by (user_id, session_id). Fails with
    /// [`StoreError::Collision`] when another partition already owns the
    /// session id; the transaction stays usable after a collision.
    async fn upsert(&mut self, state: &SessionState) -> Result<(), StoreError>;

    /// Insert a brand-new session row. Fails with [`StoreError::Collision`]
    /// when any row of the program already holds the session id, the
    /// partition's own closed sessions included. The transaction stays
    /// usable after a collision.
    async fn create(&mut self, state: &SessionState) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionStateStore: Send + Sync {
    async fn begin(&self, user_id: &str, program: &str) -> Result<Box<dyn StateTxn>, StoreError>;

    /// Unlocked read of the live state for a partition.
    async fn get(&self, user_id: &str, program: &str) -> Result<Option<SessionState>, StoreError>;

    /// Most recently updated live state across all partitions of a program.
    async fn latest_for_program(&self, program: &str) -> Result<Option<SessionState>, StoreError>;

    /// Number of session rows recorded for a program.
    async fn count_sessions(&self, program: &str) -> Result<i64, StoreError>;
}
