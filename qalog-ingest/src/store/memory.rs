use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use qalog_core::models::SessionState;
use tokio::sync::OwnedMutexGuard;

use super::{SessionStateStore, StateTxn, StoreError};

type PartitionKey = (String, String);

#[derive(Default)]
struct Inner {
    /// Keyed by (user_id, session_id).
    rows: HashMap<(String, String), SessionState>,
    counters: HashMap<String, i64>,
}

impl Inner {
    fn live(&self, user_id: &str, program: &str) -> Option<SessionState> {
        self.rows
            .values()
            .filter(|s| s.user_id == user_id && s.program == program)
            .max_by_key(|s| s.session_number)
            .cloned()
    }
}

/// Process-local store. Partitions are serialized by per-key async mutexes
/// held for the lifetime of a [`StateTxn`].
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Arc<Mutex<Inner>>,
    partition_locks: Mutex<HashMap<PartitionKey, Weak<tokio::sync::Mutex<()>>>>,
    writes: Arc<AtomicUsize>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, bypassing the transaction path.
    pub fn seed(&self, state: SessionState) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner)?;
        inner
            .rows
            .insert((state.user_id.clone(), state.session_id.clone()), state);
        Ok(())
    }

    /// All rows for a program, ordered by session number.
    pub fn rows(&self, program: &str) -> Result<Vec<SessionState>, StoreError> {
        let inner = lock(&self.inner)?;
        let mut rows: Vec<SessionState> = inner
            .rows
            .values()
            .filter(|s| s.program == program)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.session_number);
        Ok(rows)
    }

    /// Number of committed transactions that wrote a row.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn partition_lock(&self, key: &PartitionKey) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError> {
        let mut locks = self
            .partition_locks
            .lock()
            .map_err(|_| StoreError::Unavailable("partition lock map poisoned".into()))?;

        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(key.clone(), Arc::downgrade(&lock));
        Ok(lock)
    }
}

fn lock(inner: &Mutex<Inner>) -> Result<MutexGuard<'_, Inner>, StoreError> {
    inner
        .lock()
        .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))
}

struct MemoryTxn {
    user_id: String,
    program: String,
    inner: Arc<Mutex<Inner>>,
    writes: Arc<AtomicUsize>,
    staged: Option<SessionState>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl StateTxn for MemoryTxn {
    async fn load(&mut self) -> Result<Option<SessionState>, StoreError> {
        if let Some(staged) = &self.staged {
            return Ok(Some(staged.clone()));
        }
        Ok(lock(&self.inner)?.live(&self.user_id, &self.program))
    }

    async fn next_session_number(&mut self) -> Result<i64, StoreError> {
        let mut inner = lock(&self.inner)?;
        let seed = inner
            .rows
            .values()
            .filter(|s| s.program == self.program)
            .count() as i64;
        let counter = inner.counters.entry(self.program.clone()).or_insert(seed);
        *counter += 1;
        Ok(*counter)
    }

    async fn upsert(&mut self, state: &SessionState) -> Result<(), StoreError> {
        let inner = lock(&self.inner)?;
        let taken = inner.rows.values().any(|s| {
            s.program == state.program
                && s.session_id == state.session_id
                && s.user_id != state.user_id
        });
        if taken {
            return Err(StoreError::Collision {
                program: state.program.clone(),
                session_id: state.session_id.clone(),
            });
        }
        drop(inner);
        self.staged = Some(state.clone());
        Ok(())
    }

    async fn create(&mut self, state: &SessionState) -> Result<(), StoreError> {
        let inner = lock(&self.inner)?;
        let taken = inner
            .rows
            .values()
            .any(|s| s.program == state.program && s.session_id == state.session_id);
        if taken {
            return Err(StoreError::Collision {
                program: state.program.clone(),
                session_id: state.session_id.clone(),
            });
        }
        drop(inner);
        self.staged = Some(state.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let txn = *self;
        let Some(state) = txn.staged else {
            return Ok(());
        };
        let mut inner = lock(&txn.inner)?;
        inner
            .rows
            .insert((state.user_id.clone(), state.session_id.clone()), state);
        txn.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SessionStateStore for MemorySessionStore {
    async fn begin(&self, user_id: &str, program: &str) -> Result<Box<dyn StateTxn>, StoreError> {
        let key = (user_id.to_string(), program.to_string());
        let guard = self.partition_lock(&key)?.lock_owned().await;
        Ok(Box::new(MemoryTxn {
            user_id: key.0,
            program: key.1,
            inner: Arc::clone(&self.inner),
            writes: Arc::clone(&self.writes),
            staged: None,
            _guard: guard,
        }))
    }

    async fn get(&self, user_id: &str, program: &str) -> Result<Option<SessionState>, StoreError> {
        Ok(lock(&self.inner)?.live(user_id, program))
    }

    async fn latest_for_program(&self, program: &str) -> Result<Option<SessionState>, StoreError> {
        let inner = lock(&self.inner)?;
        Ok(inner
            .rows
            .values()
            .filter(|s| s.program == program)
            .max_by_key(|s| (s.updated_at, s.session_number))
            .cloned())
    }

    async fn count_sessions(&self, program: &str) -> Result<i64, StoreError> {
        let inner = lock(&self.inner)?;
        Ok(inner.rows.values().filter(|s| s.program == program).count() as i64)
    }
}
