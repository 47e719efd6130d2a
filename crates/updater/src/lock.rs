// Per-doc distributed lock.
//
// Key `Blocking:{docId}`, 30-second lease, fenced by a value unique to
// every acquisition attempt. Release is compare-and-delete on that
// value; a runner that outlives its lease skips release entirely, since
// the value has already expired and may belong to someone else.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use crate::error::UpdaterError;
use crate::kv::{keys, Kvs, LockKvs, ReleaseOutcome};

pub const LOCK_TTL: Duration = Duration::from_secs(30);
const POLL_INITIAL: Duration = Duration::from_millis(50);
const POLL_MAX: Duration = Duration::from_secs(1);
const ACQUIRE_BUDGET: Duration = Duration::from_secs(10);

/// Granted lease; operations derive their soft deadlines from it.
#[derive(Debug, Clone, Copy)]
pub struct LockLease {
    pub expires_at: Instant,
}

impl LockLease {
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

pub struct DocLock {
    kvs: Arc<dyn Kvs>,
    host_id: String,
    salt: u64,
    counter: AtomicU64,
}

impl DocLock {
    pub fn new(kvs: Arc<dyn Kvs>, host_id: impl Into<String>) -> Self {
        Self { kvs, host_id: host_id.into(), salt: rand::random(), counter: AtomicU64::new(0) }
    }

    /// Value format is diagnostic surface: it names the holder in
    /// `Blocking:{id}` when operators inspect a stuck doc.
    fn next_value(&self) -> String {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "locked:host={}:pid={}:rand={:x}:time={}:count={}",
            self.host_id,
            std::process::id(),
            self.salt,
            chrono::Utc::now().timestamp_millis(),
            count
        )
    }

    /// Runs `f` while holding the doc's lock, polling with doubling
    /// back-off for up to ten seconds when contended.
    pub async fn run_with_lock<F, Fut, T>(&self, doc_id: Uuid, f: F) -> Result<T, UpdaterError>
    where
        F: FnOnce(LockLease) -> Fut,
        Fut: Future<Output = Result<T, UpdaterError>>,
    {
        let key = keys::blocking(doc_id);
        let value = self.next_value();
        let give_up_at = Instant::now() + ACQUIRE_BUDGET;
        let mut poll = POLL_INITIAL;

        loop {
            if self.kvs.try_acquire(&key, &value, LOCK_TTL).await.map_err(UpdaterError::from)? {
                break;
            }
            if Instant::now() + poll > give_up_at {
                return Err(UpdaterError::LockTimeout);
            }
            tokio::time::sleep(poll).await;
            poll = (poll * 2).min(POLL_MAX);
        }

        self.run_held(&key, value, f).await
    }

    /// Single acquisition attempt; contention is the `Locked` sentinel so
    /// optional paths can skip the doc.
    pub async fn try_run_with_lock<F, Fut, T>(&self, doc_id: Uuid, f: F) -> Result<T, UpdaterError>
    where
        F: FnOnce(LockLease) -> Fut,
        Fut: Future<Output = Result<T, UpdaterError>>,
    {
        let key = keys::blocking(doc_id);
        let value = self.next_value();
        if !self.kvs.try_acquire(&key, &value, LOCK_TTL).await.map_err(UpdaterError::from)? {
            return Err(UpdaterError::Locked);
        }
        self.run_held(&key, value, f).await
    }

    async fn run_held<F, Fut, T>(&self, key: &str, value: String, f: F) -> Result<T, UpdaterError>
    where
        F: FnOnce(LockLease) -> Fut,
        Fut: Future<Output = Result<T, UpdaterError>>,
    {
        let lease = LockLease { expires_at: Instant::now() + LOCK_TTL };
        let result = f(lease).await;

        if Instant::now() < lease.expires_at {
            match self.kvs.release(key, &value).await {
                Ok(ReleaseOutcome::Released) => {}
                Ok(ReleaseOutcome::NotHeld) => {
                    warn!(key, "tried to release expired lock");
                }
                Err(error) => warn!(key, %error, "lock release failed"),
            }
        }
        result
    }
}
