// In-process KVS backend.
//
// One mutex over the whole keyspace gives every multi-key contract its
// atomicity for free. Dirty-doc notifications use a `Notify` per shard;
// the applied-ops channel fans out over a broadcast channel that tests
// subscribe to.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use vellum_common::ranges::Ranges;
use vellum_common::update::DocumentUpdate;

use crate::doc::Doc;
use crate::kv::{
    keys, CacheError, DocCache, DocCore, LockKvs, PendingKvs, Publisher, ReleaseOutcome,
    DOC_OPS_MAX,
};
use crate::realtime::AppliedOpsMessage;

/// A message observed on the in-process applied-ops channel.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    locks: HashMap<String, (String, Instant)>,
}

pub struct MemoryKvs {
    state: Mutex<State>,
    shard_count: usize,
    dirty: Vec<Notify>,
    events: broadcast::Sender<PublishedMessage>,
}

impl MemoryKvs {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State::default()),
            shard_count,
            dirty: (0..shard_count).map(|_| Notify::new()).collect(),
            events,
        }
    }

    /// Observe everything published on the applied-ops channel.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.events.subscribe()
    }

    /// Test hook: drop the recent-ops ring, as a TTL expiry would.
    pub fn expire_doc_ops(&self, doc_id: Uuid) {
        self.lock_state().lists.remove(&keys::doc_ops(doc_id));
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory kvs state lock poisoned")
    }

    fn read_core(state: &State, doc_id: Uuid) -> Result<DocCore, CacheError> {
        let raw = state.strings.get(&keys::doc_core(doc_id)).ok_or(CacheError::NotFound)?;
        Ok(serde_json::from_str(raw)?)
    }

    fn write_core(state: &mut State, doc_id: Uuid, core: &DocCore) -> Result<(), CacheError> {
        state.strings.insert(keys::doc_core(doc_id), serde_json::to_string(core)?);
        Ok(())
    }

    fn parse_version(raw: &str) -> Result<u64, CacheError> {
        raw.parse().map_err(|_| CacheError::Backend(format!("corrupt doc version: {raw}")))
    }
}

#[async_trait]
impl LockKvs for MemoryKvs {
    async fn try_acquire(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut state = self.lock_state();
        let now = Instant::now();
        if let Some((_, expires_at)) = state.locks.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state.locks.insert(key.to_owned(), (value.to_owned(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, value: &str) -> Result<ReleaseOutcome, CacheError> {
        let mut state = self.lock_state();
        let now = Instant::now();
        match state.locks.get(key) {
            Some((held, expires_at)) if *expires_at > now && held == value => {
                state.locks.remove(key);
                Ok(ReleaseOutcome::Released)
            }
            _ => Ok(ReleaseOutcome::NotHeld),
        }
    }
}

#[async_trait]
impl DocCache for MemoryKvs {
    async fn put_doc(&self, doc: &Doc) -> Result<(), CacheError> {
        let mut state = self.lock_state();
        Self::write_core(&mut state, doc.doc_id, &DocCore::from_doc(doc))?;
        state.strings.insert(keys::doc_version(doc.doc_id), doc.version.to_string());
        match doc.unflushed_time {
            Some(at) => {
                state.strings.insert(keys::unflushed_time(doc.doc_id), at.to_string());
            }
            None => {
                state.strings.remove(&keys::unflushed_time(doc.doc_id));
            }
        }
        state
            .sets
            .entry(keys::docs_in_project(doc.project_id))
            .or_default()
            .insert(doc.doc_id.to_string());
        Ok(())
    }

    async fn get_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<Doc, CacheError> {
        let state = self.lock_state();
        let core = Self::read_core(&state, doc_id)?;
        if core.project_id != project_id {
            return Err(CacheError::NotAuthorized);
        }
        let version = match state.strings.get(&keys::doc_version(doc_id)) {
            Some(raw) => Self::parse_version(raw)?,
            None => 0,
        };
        let unflushed_time =
            state.strings.get(&keys::unflushed_time(doc_id)).and_then(|raw| raw.parse().ok());
        let last_updated_ctx = state
            .strings
            .get(&keys::last_updated_ctx(doc_id))
            .and_then(|raw| serde_json::from_str(raw).ok());
        Ok(core.into_doc(doc_id, version, unflushed_time, last_updated_ctx))
    }

    async fn get_doc_version(&self, doc_id: Uuid) -> Result<Option<u64>, CacheError> {
        let state = self.lock_state();
        match state.strings.get(&keys::doc_version(doc_id)) {
            Some(raw) => Ok(Some(Self::parse_version(raw)?)),
            None => Ok(None),
        }
    }

    async fn update_document(
        &self,
        doc: &mut Doc,
        applied: &[DocumentUpdate],
    ) -> Result<u64, CacheError> {
        let now_secs = chrono::Utc::now().timestamp();
        let mut state = self.lock_state();

        let cached = match state.strings.get(&keys::doc_version(doc.doc_id)) {
            Some(raw) => Self::parse_version(raw)?,
            None => return Err(CacheError::NotFound),
        };
        let expected = doc.version - applied.len() as u64;
        if cached != expected {
            return Err(CacheError::VersionMismatch { cached, expected });
        }

        Self::write_core(&mut state, doc.doc_id, &DocCore::from_doc(doc))?;
        state.strings.insert(keys::doc_version(doc.doc_id), doc.version.to_string());
        if let Some(ctx) = doc.last_updated_ctx {
            state
                .strings
                .insert(keys::last_updated_ctx(doc.doc_id), serde_json::to_string(&ctx)?);
        }

        let mut encoded = Vec::with_capacity(applied.len());
        for update in applied {
            encoded.push(serde_json::to_string(update)?);
        }

        {
            let ring = state.lists.entry(keys::doc_ops(doc.doc_id)).or_default();
            while ring.len() > DOC_OPS_MAX {
                ring.pop_front();
            }
            ring.extend(encoded.iter().cloned());
        }

        let depth = {
            let history =
                state.lists.entry(keys::uncompressed_history_ops(doc.doc_id)).or_default();
            history.extend(encoded);
            history.len() as u64
        };

        let unflushed = state
            .strings
            .entry(keys::unflushed_time(doc.doc_id))
            .or_insert_with(|| now_secs.to_string());
        doc.unflushed_time = Some(
            unflushed
                .parse()
                .map_err(|_| CacheError::Backend("corrupt unflushed time".to_owned()))?,
        );

        Ok(depth)
    }

    async fn get_previous_doc_updates(
        &self,
        doc_id: Uuid,
        start: u64,
        end: u64,
    ) -> Result<Vec<DocumentUpdate>, CacheError> {
        let state = self.lock_state();
        let version = match state.strings.get(&keys::doc_version(doc_id)) {
            Some(raw) => Self::parse_version(raw)?,
            None => return Err(CacheError::NotFound),
        };
        let empty = VecDeque::new();
        let ring = state.lists.get(&keys::doc_ops(doc_id)).unwrap_or(&empty);
        let first = version.saturating_sub(ring.len() as u64);

        if start < first || end > version || start > end {
            return Err(CacheError::UpdateRangeNotAvailable);
        }

        let skip = (start - first) as usize;
        let take = (end - start) as usize;
        let mut updates: Vec<DocumentUpdate> = Vec::with_capacity(take);
        for raw in ring.iter().skip(skip).take(take) {
            updates.push(serde_json::from_str(raw)?);
        }

        if let Some(first_update) = updates.first() {
            if first_update.version != start {
                return Err(CacheError::UpdateRangeNotAvailable);
            }
        }
        Ok(updates)
    }

    async fn remove_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), CacheError> {
        let mut state = self.lock_state();
        state.strings.remove(&keys::doc_core(doc_id));
        state.strings.remove(&keys::doc_version(doc_id));
        state.strings.remove(&keys::unflushed_time(doc_id));
        state.strings.remove(&keys::last_updated_ctx(doc_id));
        state.lists.remove(&keys::doc_ops(doc_id));
        if let Some(members) = state.sets.get_mut(&keys::docs_in_project(project_id)) {
            members.remove(&doc_id.to_string());
        }
        Ok(())
    }

    async fn clear_unflushed_time(&self, doc_id: Uuid) -> Result<(), CacheError> {
        self.lock_state().strings.remove(&keys::unflushed_time(doc_id));
        Ok(())
    }

    async fn set_path_name(&self, doc_id: Uuid, path_name: &str) -> Result<(), CacheError> {
        let mut state = self.lock_state();
        let mut core = Self::read_core(&state, doc_id)?;
        core.path_name = path_name.to_owned();
        Self::write_core(&mut state, doc_id, &core)
    }

    async fn set_ranges(
        &self,
        doc_id: Uuid,
        ranges: &Ranges,
        now_secs: i64,
    ) -> Result<(), CacheError> {
        let mut state = self.lock_state();
        let mut core = Self::read_core(&state, doc_id)?;
        core.ranges = ranges.clone();
        Self::write_core(&mut state, doc_id, &core)?;
        state
            .strings
            .entry(keys::unflushed_time(doc_id))
            .or_insert_with(|| now_secs.to_string());
        Ok(())
    }

    async fn docs_in_project(&self, project_id: Uuid) -> Result<Vec<Uuid>, CacheError> {
        let state = self.lock_state();
        let Some(members) = state.sets.get(&keys::docs_in_project(project_id)) else {
            return Ok(Vec::new());
        };
        members
            .iter()
            .map(|raw| {
                Uuid::parse_str(raw)
                    .map_err(|_| CacheError::Backend(format!("corrupt doc id in project set: {raw}")))
            })
            .collect()
    }

    async fn queue_flush_and_delete(&self, project_id: Uuid) -> Result<(), CacheError> {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1000.0);
        let score = chrono::Utc::now().timestamp_millis() as f64 + jitter;
        let member = project_id.to_string();
        let mut state = self.lock_state();
        let queue = state.zsets.entry(keys::FLUSH_AND_DELETE_QUEUE.to_owned()).or_default();
        queue.retain(|(_, existing)| existing != &member);
        queue.push((score, member));
        Ok(())
    }

    async fn next_project_to_flush_and_delete(
        &self,
        cutoff_ms: i64,
    ) -> Result<Option<Uuid>, CacheError> {
        let mut state = self.lock_state();
        let Some(queue) = state.zsets.get_mut(keys::FLUSH_AND_DELETE_QUEUE) else {
            return Ok(None);
        };
        let lowest = queue
            .iter()
            .enumerate()
            .min_by(|(_, (a, _)), (_, (b, _))| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(index, (score, _))| (index, *score));
        let Some((index, score)) = lowest else { return Ok(None) };
        if score > cutoff_ms as f64 {
            return Ok(None);
        }
        let (_, member) = queue.remove(index);
        Uuid::parse_str(&member)
            .map(Some)
            .map_err(|_| CacheError::Backend(format!("corrupt project id in flush queue: {member}")))
    }

    async fn check_or_set_project_state(
        &self,
        project_id: Uuid,
        state_token: &str,
    ) -> Result<bool, CacheError> {
        let mut state = self.lock_state();
        let previous =
            state.strings.insert(keys::project_state(project_id), state_token.to_owned());
        Ok(previous.as_deref() != Some(state_token))
    }

    async fn clear_project_state(&self, project_id: Uuid) -> Result<(), CacheError> {
        self.lock_state().strings.remove(&keys::project_state(project_id));
        Ok(())
    }

    async fn record_doc_has_history(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<(), CacheError> {
        self.lock_state()
            .sets
            .entry(keys::docs_with_history_ops(project_id))
            .or_default()
            .insert(doc_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl PendingKvs for MemoryKvs {
    async fn push_update(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        update: &DocumentUpdate,
    ) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(update)?;
        let shard = rand::thread_rng().gen_range(0..self.shard_count);
        {
            let mut state = self.lock_state();
            state.lists.entry(keys::pending_updates(doc_id)).or_default().push_back(encoded);
            state
                .lists
                .entry(keys::pending_shard(shard))
                .or_default()
                .push_back(format!("{project_id}:{doc_id}"));
        }
        self.dirty[shard].notify_one();
        Ok(())
    }

    async fn drain_updates(
        &self,
        doc_id: Uuid,
        max: usize,
    ) -> Result<Vec<DocumentUpdate>, CacheError> {
        let mut state = self.lock_state();
        let Some(queue) = state.lists.get_mut(&keys::pending_updates(doc_id)) else {
            return Ok(Vec::new());
        };
        let take = queue.len().min(max);
        let mut updates = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(raw) = queue.pop_front() {
                updates.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(updates)
    }

    async fn pop_dirty_doc(
        &self,
        shard: usize,
        timeout: Duration,
    ) -> Result<Option<String>, CacheError> {
        let shard = shard % self.shard_count;
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock_state();
                if let Some(list) = state.lists.get_mut(&keys::pending_shard(shard)) {
                    if let Some(entry) = list.pop_front() {
                        return Ok(Some(entry));
                    }
                }
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            if tokio::time::timeout(remaining, self.dirty[shard].notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn shard_count(&self) -> usize {
        self.shard_count
    }
}

#[async_trait]
impl Publisher for MemoryKvs {
    async fn publish_applied_ops(
        &self,
        doc_id: Uuid,
        message: &AppliedOpsMessage,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(message)?;
        // No subscribers is fine; the fan-out service may not be attached.
        let _ = self
            .events
            .send(PublishedMessage { channel: keys::applied_ops_channel(doc_id), payload });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use vellum_common::ranges::Ranges;
    use vellum_common::update::{Component, DocumentUpdate, UpdateMeta};

    use super::MemoryKvs;
    use crate::doc::Doc;
    use crate::kv::{CacheError, DocCache, LockKvs, PendingKvs, ReleaseOutcome};

    fn live_doc(kvs_version: u64) -> Doc {
        Doc {
            doc_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            snapshot: "content".to_owned(),
            version: kvs_version,
            path_name: "/main.tex".to_owned(),
            ranges: Ranges::default(),
            revision: 1,
            unflushed_time: None,
            last_updated_ctx: None,
            just_loaded: false,
        }
    }

    fn update(doc_id: Uuid, version: u64, source: &str) -> DocumentUpdate {
        DocumentUpdate {
            doc_id,
            version,
            op: vec![Component::insertion("x", 0)],
            hash: None,
            dup: None,
            dup_if_source: None,
            meta: UpdateMeta { source: source.to_owned(), ..UpdateMeta::default() },
        }
    }

    #[tokio::test]
    async fn put_and_get_round_trip_with_project_check() {
        let kvs = MemoryKvs::new(1);
        let doc = live_doc(3);

        kvs.put_doc(&doc).await.expect("put should succeed");
        let fetched = kvs.get_doc(doc.project_id, doc.doc_id).await.expect("get should succeed");
        assert_eq!(fetched.snapshot, "content");
        assert_eq!(fetched.version, 3);
        assert_eq!(fetched.unflushed_time, None);

        assert!(matches!(
            kvs.get_doc(Uuid::new_v4(), doc.doc_id).await,
            Err(CacheError::NotAuthorized)
        ));
        assert!(matches!(
            kvs.get_doc(doc.project_id, Uuid::new_v4()).await,
            Err(CacheError::NotFound)
        ));

        let members = kvs.docs_in_project(doc.project_id).await.expect("members should list");
        assert_eq!(members, vec![doc.doc_id]);
    }

    #[tokio::test]
    async fn update_document_checks_version_and_stamps_unflushed_time() {
        let kvs = MemoryKvs::new(1);
        let mut doc = live_doc(3);
        kvs.put_doc(&doc).await.expect("put should succeed");

        doc.snapshot = "content!".to_owned();
        doc.version = 4;
        let applied = vec![update(doc.doc_id, 3, "sess-A")];

        let depth = kvs.update_document(&mut doc, &applied).await.expect("update should commit");
        assert_eq!(depth, 1);
        assert!(doc.unflushed_time.is_some());

        let fetched = kvs.get_doc(doc.project_id, doc.doc_id).await.expect("get should succeed");
        assert_eq!(fetched.version, 4);
        assert_eq!(fetched.snapshot, "content!");
        assert_eq!(fetched.unflushed_time, doc.unflushed_time);

        // A second commit that skips a version must be rejected.
        doc.version = 6;
        let stale = vec![update(doc.doc_id, 5, "sess-A")];
        assert!(matches!(
            kvs.update_document(&mut doc, &stale).await,
            Err(CacheError::VersionMismatch { cached: 4, expected: 5 })
        ));
    }

    #[tokio::test]
    async fn ring_serves_exact_ranges_and_rejects_the_rest() {
        let kvs = MemoryKvs::new(1);
        let mut doc = live_doc(10);
        kvs.put_doc(&doc).await.expect("put should succeed");

        for version in 10..13 {
            doc.version = version + 1;
            let applied = vec![update(doc.doc_id, version, "sess-A")];
            kvs.update_document(&mut doc, &applied).await.expect("update should commit");
        }

        let updates = kvs
            .get_previous_doc_updates(doc.doc_id, 10, 13)
            .await
            .expect("range should be served");
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].version, 10);
        assert_eq!(updates[2].version, 12);

        let tail = kvs
            .get_previous_doc_updates(doc.doc_id, 12, 13)
            .await
            .expect("tail should be served");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].version, 12);

        // Too old (before the ring) and crossing the live end both fail.
        assert!(matches!(
            kvs.get_previous_doc_updates(doc.doc_id, 9, 13).await,
            Err(CacheError::UpdateRangeNotAvailable)
        ));
        assert!(matches!(
            kvs.get_previous_doc_updates(doc.doc_id, 12, 14).await,
            Err(CacheError::UpdateRangeNotAvailable)
        ));

        // An expired ring cannot serve anything but the empty range.
        kvs.expire_doc_ops(doc.doc_id);
        assert!(matches!(
            kvs.get_previous_doc_updates(doc.doc_id, 12, 13).await,
            Err(CacheError::UpdateRangeNotAvailable)
        ));
    }

    #[tokio::test]
    async fn lock_is_fenced_and_expires() {
        let kvs = MemoryKvs::new(1);

        assert!(kvs
            .try_acquire("Blocking:{d}", "holder-1", Duration::from_millis(50))
            .await
            .expect("acquire should run"));
        assert!(!kvs
            .try_acquire("Blocking:{d}", "holder-2", Duration::from_millis(50))
            .await
            .expect("contended acquire should run"));

        // Releasing with the wrong value must not free the lock.
        assert_eq!(
            kvs.release("Blocking:{d}", "holder-2").await.expect("release should run"),
            ReleaseOutcome::NotHeld
        );
        assert!(!kvs
            .try_acquire("Blocking:{d}", "holder-2", Duration::from_millis(50))
            .await
            .expect("acquire should run"));

        // After expiry the lease is up for grabs and the old holder's
        // release is a no-op.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(kvs
            .try_acquire("Blocking:{d}", "holder-2", Duration::from_millis(50))
            .await
            .expect("acquire should run"));
        assert_eq!(
            kvs.release("Blocking:{d}", "holder-1").await.expect("release should run"),
            ReleaseOutcome::NotHeld
        );
    }

    #[tokio::test]
    async fn pending_queue_drains_in_fifo_batches_and_notifies_a_shard() {
        let kvs = Arc::new(MemoryKvs::new(1));
        let project_id = Uuid::new_v4();
        let doc_id = Uuid::new_v4();

        for version in 0..3 {
            kvs.push_update(project_id, doc_id, &update(doc_id, version, "sess-A"))
                .await
                .expect("push should succeed");
        }

        let first = kvs.drain_updates(doc_id, 2).await.expect("drain should succeed");
        assert_eq!(first.iter().map(|u| u.version).collect::<Vec<_>>(), vec![0, 1]);
        let rest = kvs.drain_updates(doc_id, 10).await.expect("drain should succeed");
        assert_eq!(rest.iter().map(|u| u.version).collect::<Vec<_>>(), vec![2]);

        let notification = kvs
            .pop_dirty_doc(0, Duration::from_millis(10))
            .await
            .expect("pop should succeed")
            .expect("a notification should be queued");
        assert_eq!(notification, format!("{project_id}:{doc_id}"));
    }

    #[tokio::test]
    async fn pop_dirty_doc_wakes_up_for_a_late_push() {
        let kvs = Arc::new(MemoryKvs::new(1));
        let project_id = Uuid::new_v4();
        let doc_id = Uuid::new_v4();

        let waiter = {
            let kvs = Arc::clone(&kvs);
            tokio::spawn(async move { kvs.pop_dirty_doc(0, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        kvs.push_update(project_id, doc_id, &update(doc_id, 0, "sess-A"))
            .await
            .expect("push should succeed");

        let popped = waiter
            .await
            .expect("waiter should join")
            .expect("pop should succeed")
            .expect("waiter should observe the push");
        assert_eq!(popped, format!("{project_id}:{doc_id}"));
    }

    #[tokio::test]
    async fn flush_queue_pops_lowest_score_at_or_below_cutoff() {
        let kvs = MemoryKvs::new(1);
        let project_id = Uuid::new_v4();
        kvs.queue_flush_and_delete(project_id).await.expect("queue should succeed");

        // Far-future cutoff always wins over the one-second jitter.
        let cutoff = chrono::Utc::now().timestamp_millis() + 10_000;
        let popped = kvs
            .next_project_to_flush_and_delete(cutoff)
            .await
            .expect("pop should succeed");
        assert_eq!(popped, Some(project_id));

        // Queue is drained and re-queueing replaces rather than duplicates.
        assert_eq!(
            kvs.next_project_to_flush_and_delete(cutoff).await.expect("pop should succeed"),
            None
        );
        kvs.queue_flush_and_delete(project_id).await.expect("queue should succeed");
        kvs.queue_flush_and_delete(project_id).await.expect("queue should succeed");
        assert_eq!(
            kvs.next_project_to_flush_and_delete(cutoff).await.expect("pop should succeed"),
            Some(project_id)
        );
        assert_eq!(
            kvs.next_project_to_flush_and_delete(cutoff).await.expect("pop should succeed"),
            None
        );
    }

    #[tokio::test]
    async fn project_state_token_reports_changes() {
        let kvs = MemoryKvs::new(1);
        let project_id = Uuid::new_v4();

        // First observation: no previous token counts as changed.
        assert!(kvs
            .check_or_set_project_state(project_id, "state-1")
            .await
            .expect("check should run"));
        assert!(!kvs
            .check_or_set_project_state(project_id, "state-1")
            .await
            .expect("check should run"));
        assert!(kvs
            .check_or_set_project_state(project_id, "state-2")
            .await
            .expect("check should run"));

        kvs.clear_project_state(project_id).await.expect("clear should run");
        assert!(kvs
            .check_or_set_project_state(project_id, "state-2")
            .await
            .expect("check should run"));
    }

    #[tokio::test]
    async fn concurrent_update_document_commits_exactly_once_per_version() {
        let kvs = Arc::new(MemoryKvs::new(1));
        let doc = live_doc(0);
        kvs.put_doc(&doc).await.expect("put should succeed");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let kvs = Arc::clone(&kvs);
            let mut attempt = doc.clone();
            tasks.push(tokio::spawn(async move {
                attempt.version = 1;
                let applied = vec![update(attempt.doc_id, 0, "sess-A")];
                kvs.update_document(&mut attempt, &applied).await
            }));
        }

        let mut committed = 0;
        for task in tasks {
            if task.await.expect("task should join").is_ok() {
                committed += 1;
            }
        }
        // All contenders raced version 0 → 1; exactly one may win.
        assert_eq!(committed, 1);

        let fetched = kvs.get_doc(doc.project_id, doc.doc_id).await.expect("get should succeed");
        assert_eq!(fetched.version, 1);
    }
}
