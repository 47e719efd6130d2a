// Shared-KVS capability traits and the bit-exact cache keyspace.
//
// Backends are variants selected by configuration: `MemoryKvs` keeps the
// whole keyspace in-process (tests, single node), `RedisKvs` talks to a
// shared Redis. Every multi-key contract (`update_document`, the ring
// range read, the queue pop) is atomic inside the backend.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use vellum_common::update::DocumentUpdate;

use crate::doc::Doc;
use crate::realtime::AppliedOpsMessage;

/// Exact key formats. The braces are hash tags so a clustered backend
/// co-locates all keys of one doc.
pub mod keys {
    use uuid::Uuid;

    pub fn doc_core(doc_id: Uuid) -> String {
        format!("docCore:{{{doc_id}}}")
    }

    pub fn doc_version(doc_id: Uuid) -> String {
        format!("DocVersion:{{{doc_id}}}")
    }

    pub fn unflushed_time(doc_id: Uuid) -> String {
        format!("UnflushedTime:{{{doc_id}}}")
    }

    pub fn last_updated_ctx(doc_id: Uuid) -> String {
        format!("lastUpdatedCtx:{{{doc_id}}}")
    }

    pub fn doc_ops(doc_id: Uuid) -> String {
        format!("DocOps:{{{doc_id}}}")
    }

    pub fn uncompressed_history_ops(doc_id: Uuid) -> String {
        format!("UncompressedHistoryOps:{{{doc_id}}}")
    }

    pub fn pending_updates(doc_id: Uuid) -> String {
        format!("PendingUpdates:{{{doc_id}}}")
    }

    pub fn blocking(doc_id: Uuid) -> String {
        format!("Blocking:{{{doc_id}}}")
    }

    pub fn docs_in_project(project_id: Uuid) -> String {
        format!("DocsIn:{{{project_id}}}")
    }

    pub fn docs_with_history_ops(project_id: Uuid) -> String {
        format!("DocsWithHistoryOps:{{{project_id}}}")
    }

    pub fn project_state(project_id: Uuid) -> String {
        format!("ProjectState:{{{project_id}}}")
    }

    pub const FLUSH_AND_DELETE_QUEUE: &str = "DocUpdaterFlushAndDeleteQueue";

    /// Dirty-doc notification list for one dispatcher shard.
    pub fn pending_shard(shard: usize) -> String {
        if shard == 0 {
            "pending-updates-list".to_owned()
        } else {
            format!("pending-updates-list-{shard}")
        }
    }

    pub fn applied_ops_channel(doc_id: Uuid) -> String {
        format!("applied-ops:{{{doc_id}}}")
    }
}

/// Serde shape of the `docCore:{id}` value. Shared by all backends so
/// the cache contents stay interchangeable.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct DocCore {
    #[serde(rename = "projectId")]
    pub project_id: Uuid,
    #[serde(rename = "pathName")]
    pub path_name: String,
    pub snapshot: String,
    #[serde(default)]
    pub ranges: vellum_common::ranges::Ranges,
    pub revision: i64,
}

impl DocCore {
    pub fn from_doc(doc: &Doc) -> Self {
        Self {
            project_id: doc.project_id,
            path_name: doc.path_name.clone(),
            snapshot: doc.snapshot.clone(),
            ranges: doc.ranges.clone(),
            revision: doc.revision,
        }
    }

    pub fn into_doc(
        self,
        doc_id: Uuid,
        version: u64,
        unflushed_time: Option<i64>,
        last_updated_ctx: Option<crate::doc::LastUpdatedCtx>,
    ) -> Doc {
        Doc {
            doc_id,
            project_id: self.project_id,
            snapshot: self.snapshot,
            version,
            path_name: self.path_name,
            ranges: self.ranges,
            revision: self.revision,
            unflushed_time,
            last_updated_ctx,
            just_loaded: false,
        }
    }
}

/// The recent-ops ring keeps at most this many applied updates.
pub const DOC_OPS_MAX: usize = 100;

/// The ring expires when a doc sits idle this long.
pub const DOC_OPS_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("doc not found in cache")]
    NotFound,
    #[error("doc does not belong to the requested project")]
    NotAuthorized,
    #[error("remote version mismatches local: cached {cached}, expected {expected}")]
    VersionMismatch { cached: u64, expected: u64 },
    #[error("update range is not available in the recent-ops ring")]
    UpdateRangeNotAvailable,
    #[error("cache codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("kvs backend: {0}")]
    Backend(String),
}

/// Outcome of a fenced lock release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The stored value differed: the lease expired and was taken over.
    NotHeld,
}

/// Distributed-lock primitives (C1 transport).
#[async_trait]
pub trait LockKvs: Send + Sync {
    /// Atomic set-if-absent with a TTL. Returns false when contended.
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CacheError>;

    /// Compare-and-delete on the fenced value.
    async fn release(&self, key: &str, value: &str) -> Result<ReleaseOutcome, CacheError>;
}

/// Hot document cache (C2).
#[async_trait]
pub trait DocCache: Send + Sync {
    /// Writes core + version (and unflushed time when set) and adds the
    /// doc to its project's membership set, atomically.
    async fn put_doc(&self, doc: &Doc) -> Result<(), CacheError>;

    /// `NotFound` when the core key is missing, `NotAuthorized` when the
    /// cached doc belongs to a different project.
    async fn get_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<Doc, CacheError>;

    /// Unlocked probe used by flush fast paths.
    async fn get_doc_version(&self, doc_id: Uuid) -> Result<Option<u64>, CacheError>;

    /// Atomic post-apply commit: re-checks the cached version against
    /// `doc.version - applied.len()`, overwrites core/version/ctx, trims
    /// the recent-ops ring to the last 100 and pushes `applied`, mirrors
    /// them onto the history list, and stamps the unflushed time when
    /// absent (reflected into `doc`). Returns the history list depth.
    async fn update_document(
        &self,
        doc: &mut Doc,
        applied: &[DocumentUpdate],
    ) -> Result<u64, CacheError>;

    /// Exactly the updates at versions `[start, end)` from the ring, or
    /// `UpdateRangeNotAvailable` when the range is not fully contained.
    async fn get_previous_doc_updates(
        &self,
        doc_id: Uuid,
        start: u64,
        end: u64,
    ) -> Result<Vec<DocumentUpdate>, CacheError>;

    /// Removes every per-doc key and the project-set membership.
    async fn remove_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), CacheError>;

    async fn clear_unflushed_time(&self, doc_id: Uuid) -> Result<(), CacheError>;

    /// Rewrites the cached core with a new path name.
    async fn set_path_name(&self, doc_id: Uuid, path_name: &str) -> Result<(), CacheError>;

    /// Rewrites the cached core ranges, stamping the unflushed time when
    /// absent (the review state now diverges from durable).
    async fn set_ranges(
        &self,
        doc_id: Uuid,
        ranges: &vellum_common::ranges::Ranges,
        now_secs: i64,
    ) -> Result<(), CacheError>;

    async fn docs_in_project(&self, project_id: Uuid) -> Result<Vec<Uuid>, CacheError>;

    /// Schedules a project for flush-and-delete with up to one second of
    /// jitter against thundering herds.
    async fn queue_flush_and_delete(&self, project_id: Uuid) -> Result<(), CacheError>;

    /// Atomically pops the lowest-scored queue entry at or below
    /// `cutoff_ms`. Under races the popped score may exceed the cutoff;
    /// that is tolerated.
    async fn next_project_to_flush_and_delete(
        &self,
        cutoff_ms: i64,
    ) -> Result<Option<Uuid>, CacheError>;

    /// Swaps the opaque project-state token. Returns true when the
    /// previous token differed (including when none was set).
    async fn check_or_set_project_state(
        &self,
        project_id: Uuid,
        state: &str,
    ) -> Result<bool, CacheError>;

    async fn clear_project_state(&self, project_id: Uuid) -> Result<(), CacheError>;

    /// Marks a doc as having unflushed history ops.
    async fn record_doc_has_history(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<(), CacheError>;
}

/// Per-doc pending update queue plus the sharded dirty-doc notifications (C3).
#[async_trait]
pub trait PendingKvs: Send + Sync {
    /// Appends an encoded update to the doc's queue and notifies a
    /// uniformly random shard with `"<projectId>:<docId>"`.
    async fn push_update(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        update: &DocumentUpdate,
    ) -> Result<(), CacheError>;

    /// Atomically reads and trims up to `max` updates from the front of
    /// the doc's queue.
    async fn drain_updates(
        &self,
        doc_id: Uuid,
        max: usize,
    ) -> Result<Vec<DocumentUpdate>, CacheError>;

    /// Blocks until a dirty-doc notification arrives on `shard` or the
    /// timeout elapses.
    async fn pop_dirty_doc(
        &self,
        shard: usize,
        timeout: Duration,
    ) -> Result<Option<String>, CacheError>;

    fn shard_count(&self) -> usize;
}

/// Applied-ops fan-out (the real-time channel).
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_applied_ops(
        &self,
        doc_id: Uuid,
        message: &AppliedOpsMessage,
    ) -> Result<(), CacheError>;
}

/// The full backend surface the updater needs from its KVS.
pub trait Kvs: LockKvs + DocCache + PendingKvs + Publisher {}

impl<T: LockKvs + DocCache + PendingKvs + Publisher> Kvs for T {}
