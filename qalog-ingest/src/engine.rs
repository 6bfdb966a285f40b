//! Iteration Assignment Engine
//!
//! Buckets a stream of events into monotonically increasing iterations within
//! an auto-rolling session, per (user, program) partition:
//!
//! - Same bucket as the partition's last bucket → join the current iteration,
//!   no write.
//! - New bucket, iteration below the ceiling → iteration + 1, remember bucket.
//! - New bucket, iteration at the ceiling (or no state yet) → open a new
//!   session `{program}_Test_{n}` and make the event its iteration 1.
//!
//! The load/decide/write sequence runs inside one [`StateTxn`], so concurrent
//! events for the same partition are serialized and events sharing a bucket
//! all observe the same iteration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use qalog_core::config::{IterationConfig, SessionScope};
use qalog_core::QaLogError;
use qalog_core::models::SessionState;
use serde::Serialize;
use thiserror::Error;

use crate::bucket::{bucket_key, parse_timestamp};
use crate::store::{SessionStateStore, StateTxn, StoreError};

/// Partition user shared by everyone when sessions are scoped per program.
pub const PROGRAM_SCOPE_USER: &str = "*";

#[derive(Error, Debug)]
pub enum AssignError {
    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("Iteration assignment timed out after {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct IterationPolicy {
    pub bucket_size_seconds: i64,
    pub ceiling: i32,
    pub timeout: Duration,
    pub scope: SessionScope,
    pub local_offset: FixedOffset,
}

impl IterationPolicy {
    pub fn from_config(config: &IterationConfig) -> Result<Self, QaLogError> {
        Ok(Self {
            bucket_size_seconds: config.bucket_size_seconds,
            ceiling: config.ceiling,
            timeout: Duration::from_millis(config.assign_timeout_ms),
            scope: config.scope,
            local_offset: config.offset()?,
        })
    }

    /// Partition user for a resolved identity under the configured scope.
    pub fn partition_user<'a>(&self, user_id: &'a str) -> &'a str {
        match self.scope {
            SessionScope::User => user_id,
            SessionScope::Program => PROGRAM_SCOPE_USER,
        }
    }
}

impl Default for IterationPolicy {
    fn default() -> Self {
        let config = IterationConfig::default();
        Self {
            bucket_size_seconds: config.bucket_size_seconds,
            ceiling: config.ceiling,
            timeout: Duration::from_millis(config.assign_timeout_ms),
            scope: config.scope,
            local_offset: Utc.fix(),
        }
    }
}

/// How an event's iteration was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Joined,
    Advanced,
    Created,
    RolledOver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub session_id: String,
    pub iteration: i32,
    pub outcome: Outcome,
    pub bucket: DateTime<Utc>,
}

/// Decision for one event given the partition's live state.
#[derive(Debug, PartialEq, Eq)]
enum Plan {
    Join(SessionState),
    Advance(SessionState),
    Open { rollover: bool },
}

fn plan(current: Option<SessionState>, bucket: DateTime<Utc>, ceiling: i32) -> Plan {
    match current {
        None => Plan::Open { rollover: false },
        Some(state) if state.last_bucket == Some(bucket) => Plan::Join(state),
        Some(state) if state.iteration >= ceiling => Plan::Open { rollover: true },
        Some(state) => Plan::Advance(advance(state, bucket)),
    }
}

fn advance(mut state: SessionState, bucket: DateTime<Utc>) -> SessionState {
    state.iteration += 1;
    state.last_bucket = Some(bucket);
    state.updated_at = Utc::now();
    state
}

pub struct IterationEngine {
    store: Arc<dyn SessionStateStore>,
    policy: IterationPolicy,
}

impl IterationEngine {
    pub fn new(store: Arc<dyn SessionStateStore>, policy: IterationPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &IterationPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn SessionStateStore> {
        &self.store
    }

    /// Assign the event at `timestamp` to a session and iteration.
    ///
    /// An unparseable timestamp fails before the store is touched. The whole
    /// critical section is bounded by the policy timeout; on timeout the
    /// partition is left as it was.
    pub async fn assign(
        &self,
        program: &str,
        user_id: &str,
        timestamp: &str,
    ) -> Result<Assignment, AssignError> {
        let ts = parse_timestamp(timestamp, &self.policy.local_offset)
            .ok_or_else(|| AssignError::InvalidTimestamp(timestamp.to_string()))?;
        self.assign_at(program, user_id, ts).await
    }

    pub async fn assign_at(
        &self,
        program: &str,
        user_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<Assignment, AssignError> {
        let bucket = bucket_key(ts, self.policy.bucket_size_seconds);
        let partition = self.policy.partition_user(user_id);

        match tokio::time::timeout(self.policy.timeout, self.assign_locked(program, partition, bucket)).await {
            Ok(result) => result,
            Err(_) => {
                let ms = self.policy.timeout.as_millis() as u64;
                tracing::warn!(program, user = partition, timeout_ms = ms, "Iteration assignment timed out");
                Err(AssignError::Timeout(ms))
            }
        }
    }

    async fn assign_locked(
        &self,
        program: &str,
        user_id: &str,
        bucket: DateTime<Utc>,
    ) -> Result<Assignment, AssignError> {
        let mut txn = self.store.begin(user_id, program).await?;
        let current = txn.load().await?;

        let assignment = match plan(current, bucket, self.policy.ceiling) {
            Plan::Join(state) => {
                tracing::debug!(program, user = user_id, session_id = %state.session_id, iteration = state.iteration, "Event joined current iteration");
                Assignment {
                    session_id: state.session_id,
                    iteration: state.iteration,
                    outcome: Outcome::Joined,
                    bucket,
                }
            }
            Plan::Advance(next) => {
                txn.upsert(&next).await?;
                tracing::debug!(program, user = user_id, session_id = %next.session_id, iteration = next.iteration, %bucket, "Advanced iteration");
                Assignment {
                    session_id: next.session_id,
                    iteration: next.iteration,
                    outcome: Outcome::Advanced,
                    bucket,
                }
            }
            Plan::Open { rollover } => {
                let opened = open_session(txn.as_mut(), user_id, program, bucket).await?;
                tracing::info!(program, user = user_id, session_id = %opened.session_id, rollover, "Opened new session");
                Assignment {
                    session_id: opened.session_id,
                    iteration: opened.iteration,
                    outcome: if rollover { Outcome::RolledOver } else { Outcome::Created },
                    bucket,
                }
            }
        };

        txn.commit().await?;
        Ok(assignment)
    }
}

/// Reserve a session number and insert iteration 1 of the new session. A
/// collision with any existing session id, the partition's own included, is
/// retried once with a freshly reserved number.
async fn open_session(
    txn: &mut dyn StateTxn,
    user_id: &str,
    program: &str,
    bucket: DateTime<Utc>,
) -> Result<SessionState, StoreError> {
    let number = txn.next_session_number().await?;
    let state = advance(SessionState::fresh(user_id, program, number), bucket);
    match txn.create(&state).await {
        Ok(()) => Ok(state),
        Err(StoreError::Collision { session_id, .. }) => {
            tracing::warn!(program, session_id = %session_id, "Session id collision, reserving a new number");
            let number = txn.next_session_number().await?;
            let state = advance(SessionState::fresh(user_id, program, number), bucket);
            txn.create(&state).await?;
            Ok(state)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn engine_with(store: Arc<MemorySessionStore>, policy: IterationPolicy) -> IterationEngine {
        IterationEngine::new(store, policy)
    }

    fn engine() -> (Arc<MemorySessionStore>, IterationEngine) {
        let store = Arc::new(MemorySessionStore::new());
        let engine = engine_with(Arc::clone(&store), IterationPolicy::default());
        (store, engine)
    }

    fn at(secs: i64, millis: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_261_600 + secs, millis * 1_000_000)
            .single()
            .unwrap()
    }

    // ========================================================================
    // TEST 1: plan() decisions
    // ========================================================================
    #[test]
    fn test_plan_decisions() {
        let bucket = at(0, 0);
        assert_eq!(plan(None, bucket, 50), Plan::Open { rollover: false });

        let mut state = SessionState::fresh("u", "p", 1);
        state.iteration = 3;
        state.last_bucket = Some(bucket);
        assert!(matches!(plan(Some(state.clone()), bucket, 50), Plan::Join(_)));

        match plan(Some(state.clone()), at(2, 0), 50) {
            Plan::Advance(next) => {
                assert_eq!(next.iteration, 4);
                assert_eq!(next.last_bucket, Some(at(2, 0)));
            }
            other => panic!("expected advance, got {:?}", other),
        }

        state.iteration = 50;
        assert_eq!(plan(Some(state.clone()), at(2, 0), 50), Plan::Open { rollover: true });
        // Same bucket at the ceiling still joins.
        assert!(matches!(plan(Some(state), bucket, 50), Plan::Join(_)));
    }

    // ========================================================================
    // TEST 2: end-to-end Checkout scenario
    // ========================================================================
    #[tokio::test]
    async fn test_checkout_scenario() {
        let (store, engine) = engine();

        let a = engine.assign_at("Checkout", "alice", at(0, 100)).await.unwrap();
        assert_eq!(a.session_id, "Checkout_Test_1");
        assert_eq!(a.iteration, 1);
        assert_eq!(a.outcome, Outcome::Created);

        let b = engine.assign_at("Checkout", "alice", at(0, 900)).await.unwrap();
        assert_eq!(b.session_id, "Checkout_Test_1");
        assert_eq!(b.iteration, 1);
        assert_eq!(b.outcome, Outcome::Joined);

        let c = engine.assign_at("Checkout", "alice", at(2, 300)).await.unwrap();
        assert_eq!(c.iteration, 2);
        assert_eq!(c.outcome, Outcome::Advanced);

        let mut last = c;
        for i in 0..48 {
            last = engine
                .assign_at("Checkout", "alice", at(4 + 2 * i, 0))
                .await
                .unwrap();
        }
        assert_eq!(last.session_id, "Checkout_Test_1");
        assert_eq!(last.iteration, 50);

        let rolled = engine.assign_at("Checkout", "alice", at(200, 0)).await.unwrap();
        assert_eq!(rolled.session_id, "Checkout_Test_2");
        assert_eq!(rolled.iteration, 1);
        assert_eq!(rolled.outcome, Outcome::RolledOver);

        // The old session stays closed at the ceiling.
        let rows = store.rows("Checkout").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].iteration, 50);
        assert_eq!(rows[1].iteration, 1);
    }

    // ========================================================================
    // TEST 3: sequential distinct buckets yield 1..=N
    // ========================================================================
    #[tokio::test]
    async fn test_monotonic_sequential() {
        let (_store, engine) = engine();
        for n in 1..=20 {
            let a = engine.assign_at("P", "u", at(2 * n as i64, 0)).await.unwrap();
            assert_eq!(a.iteration, n);
        }
    }

    // ========================================================================
    // TEST 4: concurrent distinct buckets: no duplicates, no gaps
    // ========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_buckets_unique_iterations() {
        let store = Arc::new(MemorySessionStore::new());
        let engine = Arc::new(engine_with(Arc::clone(&store), IterationPolicy::default()));

        let mut handles = Vec::new();
        for n in 0..30 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.assign_at("P", "u", at(2 * n, 0)).await.unwrap().iteration
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()), "duplicate iteration");
        }
        let expected: HashSet<i32> = (1..=30).collect();
        assert_eq!(seen, expected);
        assert_eq!(store.get("u", "P").await.unwrap().unwrap().iteration, 30);
    }

    // ========================================================================
    // TEST 5: concurrent same-bucket events observe one iteration
    // ========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_bucket_shares_iteration() {
        let store = Arc::new(MemorySessionStore::new());
        let engine = Arc::new(engine_with(Arc::clone(&store), IterationPolicy::default()));
        engine.assign_at("P", "u", at(0, 0)).await.unwrap();

        let mut handles = Vec::new();
        for ms in 0..20 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.assign_at("P", "u", at(2, ms * 50)).await.unwrap().iteration
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 2);
        }
        // One write for the first event, one for the burst.
        assert_eq!(store.write_count(), 2);
    }

    // ========================================================================
    // TEST 6: same-bucket repeat performs no write
    // ========================================================================
    #[tokio::test]
    async fn test_same_bucket_is_idempotent() {
        let (store, engine) = engine();
        engine.assign_at("P", "u", at(0, 100)).await.unwrap();
        let before = store.get("u", "P").await.unwrap().unwrap();
        let writes = store.write_count();

        engine.assign_at("P", "u", at(1, 999)).await.unwrap();
        let after = store.get("u", "P").await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(store.write_count(), writes);
    }

    // ========================================================================
    // TEST 7: invalid timestamp leaves state untouched
    // ========================================================================
    #[tokio::test]
    async fn test_invalid_timestamp_no_mutation() {
        let (store, engine) = engine();
        engine.assign("P", "u", "2026-01-01T00:00:00Z").await.unwrap();
        let before = store.get("u", "P").await.unwrap();

        let err = engine.assign("P", "u", "not-a-time").await.unwrap_err();
        assert!(matches!(err, AssignError::InvalidTimestamp(_)));
        assert_eq!(store.get("u", "P").await.unwrap(), before);
        assert_eq!(store.write_count(), 1);
    }

    // ========================================================================
    // TEST 8: concurrent rollovers across users never share a session id
    // ========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rollover_distinct_session_ids() {
        let store = Arc::new(MemorySessionStore::new());
        let policy = IterationPolicy {
            ceiling: 2,
            ..IterationPolicy::default()
        };
        let engine = Arc::new(engine_with(Arc::clone(&store), policy));

        let users: Vec<String> = (0..8).map(|i| format!("user-{}", i)).collect();
        let mut handles = Vec::new();
        for user in users {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for n in 0..6 {
                    ids.push(engine.assign_at("Shop", &user, at(2 * n, 0)).await.unwrap().session_id);
                }
                ids
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let rows = store.rows("Shop").unwrap();
        let ids: HashSet<&str> = rows.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(ids.len(), rows.len(), "session ids must be unique");
        // 8 users x 3 sessions each, numbered 1..=24 without reuse.
        let numbers: HashSet<i64> = rows.iter().map(|r| r.session_number).collect();
        assert_eq!(numbers, (1..=24).collect());
    }

    // ========================================================================
    // TEST 9: rollover increments the suffix by exactly one
    // ========================================================================
    #[tokio::test]
    async fn test_rollover_increments_suffix_by_one() {
        let store = Arc::new(MemorySessionStore::new());
        let policy = IterationPolicy {
            ceiling: 3,
            ..IterationPolicy::default()
        };
        let engine = engine_with(Arc::clone(&store), policy);

        let mut ids = Vec::new();
        for n in 0..10 {
            let a = engine.assign_at("P", "u", at(2 * n, 0)).await.unwrap();
            ids.push((a.session_id, a.iteration));
        }
        assert_eq!(ids[2], ("P_Test_1".to_string(), 3));
        assert_eq!(ids[3], ("P_Test_2".to_string(), 1));
        assert_eq!(ids[6], ("P_Test_3".to_string(), 1));
        assert_eq!(ids[9], ("P_Test_4".to_string(), 1));
    }

    // ========================================================================
    // TEST 10: legacy numbering gap triggers a single collision retry
    // ========================================================================
    #[tokio::test]
    async fn test_collision_retries_with_next_number() {
        let store = Arc::new(MemorySessionStore::new());
        // Two historical rows numbered 1 and 3: count + 1 = 3 collides.
        store.seed(SessionState::fresh("bob", "P", 1)).unwrap();
        store.seed(SessionState::fresh("carol", "P", 3)).unwrap();
        let engine = engine_with(Arc::clone(&store), IterationPolicy::default());

        let a = engine.assign_at("P", "alice", at(0, 0)).await.unwrap();
        assert_eq!(a.session_id, "P_Test_4");
        assert_eq!(a.iteration, 1);
    }

    // ========================================================================
    // TEST 11: a gap landing on the user's own closed session is skipped
    // ========================================================================
    #[tokio::test]
    async fn test_rollover_never_reuses_own_session_id() {
        let store = Arc::new(MemorySessionStore::new());
        store.seed(SessionState::fresh("bob", "P", 1)).unwrap();
        let mut closed = SessionState::fresh("alice", "P", 3);
        closed.iteration = 50;
        closed.last_bucket = Some(at(0, 0));
        store.seed(closed).unwrap();
        let engine = engine_with(Arc::clone(&store), IterationPolicy::default());

        let a = engine.assign_at("P", "alice", at(2, 0)).await.unwrap();
        assert_eq!(a.session_id, "P_Test_4");
        assert_eq!(a.iteration, 1);
        assert_eq!(a.outcome, Outcome::RolledOver);

        let rows: Vec<(String, String, i32)> = store
            .rows("P")
            .unwrap()
            .into_iter()
            .map(|r| (r.user_id, r.session_id, r.iteration))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("bob".to_string(), "P_Test_1".to_string(), 0),
                ("alice".to_string(), "P_Test_3".to_string(), 50),
                ("alice".to_string(), "P_Test_4".to_string(), 1),
            ]
        );
    }

    // ========================================================================
    // TEST 12: a burst straddling a rollover stays in iteration 1
    // ========================================================================
    #[tokio::test]
    async fn test_rollover_bucket_is_joined_by_followers() {
        let store = Arc::new(MemorySessionStore::new());
        let policy = IterationPolicy {
            ceiling: 3,
            ..IterationPolicy::default()
        };
        let engine = engine_with(Arc::clone(&store), policy);

        for n in 0..3 {
            engine.assign_at("P", "u", at(2 * n, 0)).await.unwrap();
        }

        let first = engine.assign_at("P", "u", at(6, 100)).await.unwrap();
        assert_eq!(first.session_id, "P_Test_2");
        assert_eq!(first.iteration, 1);
        assert_eq!(first.outcome, Outcome::RolledOver);
        let writes = store.write_count();

        let second = engine.assign_at("P", "u", at(6, 900)).await.unwrap();
        assert_eq!(second.session_id, "P_Test_2");
        assert_eq!(second.iteration, 1);
        assert_eq!(second.outcome, Outcome::Joined);
        assert_eq!(store.write_count(), writes);
    }

    // ========================================================================
    // TEST 13: program scope shares one partition across users
    // ========================================================================
    #[tokio::test]
    async fn test_program_scope_shares_partition() {
        let store = Arc::new(MemorySessionStore::new());
        let policy = IterationPolicy {
            scope: SessionScope::Program,
            ..IterationPolicy::default()
        };
        let engine = engine_with(Arc::clone(&store), policy);

        let a = engine.assign_at("P", "alice", at(0, 0)).await.unwrap();
        let b = engine.assign_at("P", "bob", at(0, 500)).await.unwrap();
        let c = engine.assign_at("P", "bob", at(2, 0)).await.unwrap();
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(b.iteration, 1);
        assert_eq!(c.iteration, 2);
        assert!(store.get(PROGRAM_SCOPE_USER, "P").await.unwrap().is_some());
    }

    // ========================================================================
    // TEST 14: partitions are independent
    // ========================================================================
    #[tokio::test]
    async fn test_users_have_independent_iterations() {
        let (_store, engine) = engine();
        engine.assign_at("P", "alice", at(0, 0)).await.unwrap();
        engine.assign_at("P", "alice", at(2, 0)).await.unwrap();
        let bob = engine.assign_at("P", "bob", at(4, 0)).await.unwrap();
        assert_eq!(bob.iteration, 1);
        assert_eq!(bob.session_id, "P_Test_2");
    }

    // ========================================================================
    // TEST 15: slow store surfaces as Timeout without state change
    // ========================================================================
    struct StalledStore;

    #[async_trait]
    impl SessionStateStore for StalledStore {
        async fn begin(&self, _: &str, _: &str) -> Result<Box<dyn StateTxn>, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(StoreError::Unavailable("stalled".into()))
        }
        async fn get(&self, _: &str, _: &str) -> Result<Option<SessionState>, StoreError> {
            Ok(None)
        }
        async fn latest_for_program(&self, _: &str) -> Result<Option<SessionState>, StoreError> {
            Ok(None)
        }
        async fn count_sessions(&self, _: &str) -> Result<i64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let policy = IterationPolicy {
            timeout: Duration::from_millis(20),
            ..IterationPolicy::default()
        };
        let engine = IterationEngine::new(Arc::new(StalledStore), policy);
        let err = engine.assign_at("P", "u", at(0, 0)).await.unwrap_err();
        assert!(matches!(err, AssignError::Timeout(20)));
    }
}
