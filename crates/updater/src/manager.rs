// Doc manager: the public surface of the updater.
//
// Every mutating operation runs under the doc's distributed lock. Locked
// drains are bounded by a soft deadline of min(10 s, half the remaining
// lease); crossing it yields `PartialFlush`, which releases the lock and
// retries so long writers never ride a lease to expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use vellum_common::ot::{content_hash_hex, diff};
use vellum_common::update::{DocumentUpdate, UpdateMeta};

use crate::doc::{Doc, MAX_DOC_BYTES};
use crate::error::UpdaterError;
use crate::kv::{CacheError, DocCache, Kvs};
use crate::lock::{DocLock, LockLease};
use crate::persistence::FlushedDocStore;
use crate::pipeline::{apply_update, UpdateManager, MAX_DRAIN};
use crate::realtime::RealtimePublisher;

const MAX_PARTIAL_FLUSH_RETRIES: usize = 5;
const SOFT_BUDGET_MAX: Duration = Duration::from_secs(10);
const DETACHED_BUDGET: Duration = Duration::from_secs(10);

/// Docs untouched for this long get flushed by the soft-flush sweep.
const FLUSH_IF_OLDER_THAN_SECS: i64 = 5 * 60;

/// External overwrite request for `set_doc`.
#[derive(Debug, Clone)]
pub struct SetDocRequest {
    pub snapshot: String,
    pub source: String,
    pub user_id: Option<Uuid>,
    pub undo: bool,
}

pub struct DocManager {
    kvs: Arc<dyn Kvs>,
    lock: Arc<DocLock>,
    updates: UpdateManager,
    store: Arc<dyn FlushedDocStore>,
    publisher: RealtimePublisher,
}

fn soft_deadline(lease: &LockLease) -> Instant {
    Instant::now() + SOFT_BUDGET_MAX.min(lease.remaining() / 2)
}

impl DocManager {
    pub fn new(
        kvs: Arc<dyn Kvs>,
        lock: Arc<DocLock>,
        updates: UpdateManager,
        store: Arc<dyn FlushedDocStore>,
        publisher: RealtimePublisher,
    ) -> Self {
        Self { kvs, lock, updates, store, publisher }
    }

    /// Fast path reads the cache; a miss takes the lock, re-reads, and
    /// loads from the authoritative store.
    pub async fn get_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<Doc, UpdaterError> {
        match self.kvs.get_doc(project_id, doc_id).await {
            Ok(doc) => Ok(doc),
            Err(CacheError::NotFound) => {
                self.lock
                    .run_with_lock(doc_id, |_| self.get_or_load_doc(project_id, doc_id))
                    .await
            }
            Err(error) => Err(error.into()),
        }
    }

    /// The live doc plus every update at `[from_version, doc.version)`.
    pub async fn get_doc_and_recent_updates(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        from_version: u64,
    ) -> Result<(Doc, Vec<DocumentUpdate>), UpdaterError> {
        let doc = self.get_doc(project_id, doc_id).await?;
        if from_version >= doc.version {
            return Ok((doc, Vec::new()));
        }
        let updates = self.kvs.get_previous_doc_updates(doc_id, from_version, doc.version).await?;
        Ok((doc, updates))
    }

    /// Overwrites the doc with an externally produced snapshot: drains
    /// pending first, then ingests the diff as a single synthetic update
    /// and flushes. A doc loaded just for this call is evicted again.
    pub async fn set_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        request: SetDocRequest,
    ) -> Result<(), UpdaterError> {
        if request.snapshot.len() > MAX_DOC_BYTES {
            return Err(UpdaterError::BodyTooLarge);
        }

        self.with_partial_flush_retries(|| {
            let request = &request;
            self.lock.run_with_lock(doc_id, move |lease| async move {
                let mut doc = self.get_or_load_doc(project_id, doc_id).await?;
                let evict_after = doc.just_loaded;
                let mut cache = Vec::new();
                self.drain_pending(&mut doc, &mut cache, &lease).await?;

                let mut op = diff(&doc.snapshot, &request.snapshot);
                if request.undo {
                    for component in &mut op {
                        component.mark_undo();
                    }
                }

                if !op.is_empty() {
                    let update = DocumentUpdate {
                        doc_id,
                        version: doc.version,
                        op,
                        hash: Some(content_hash_hex(&request.snapshot)),
                        dup: None,
                        dup_if_source: None,
                        meta: UpdateMeta {
                            kind: Some("external".to_owned()),
                            source: request.source.clone(),
                            user_id: request.user_id,
                            ingestion_time: Some(chrono::Utc::now().timestamp_millis()),
                        },
                    };
                    let processed = apply_update(&mut doc, &mut cache, update)?;
                    self.updates.persist_processed_updates(&mut doc, &[processed]).await?;
                }

                self.do_flush_and_maybe_delete(&mut doc, evict_after).await
            })
        })
        .await
    }

    pub async fn flush_doc_if_loaded(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<(), UpdaterError> {
        if self.kvs.get_doc_version(doc_id).await?.is_none() {
            return Ok(());
        }
        self.flush_doc(project_id, doc_id, false).await
    }

    pub async fn flush_and_delete_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<(), UpdaterError> {
        if self.kvs.get_doc_version(doc_id).await?.is_none() {
            return Ok(());
        }
        self.flush_doc(project_id, doc_id, true).await
    }

    pub async fn flush_project(&self, project_id: Uuid) -> Result<(), UpdaterError> {
        self.for_each_project_doc(project_id, false).await
    }

    pub async fn flush_and_delete_project(&self, project_id: Uuid) -> Result<(), UpdaterError> {
        self.for_each_project_doc(project_id, true).await
    }

    /// Schedules the project for the background flush worker instead of
    /// flushing inline.
    pub async fn queue_flush_and_delete_project(
        &self,
        project_id: Uuid,
    ) -> Result<(), UpdaterError> {
        self.kvs.queue_flush_and_delete(project_id).await.map_err(UpdaterError::from)
    }

    /// Drains pending updates for one doc under its lock.
    pub async fn process_updates_for_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<(), UpdaterError> {
        self.with_partial_flush_retries(|| {
            self.lock.run_with_lock(doc_id, |lease| async move {
                let mut doc = self.get_or_load_doc(project_id, doc_id).await?;
                let mut cache = Vec::new();
                self.drain_pending(&mut doc, &mut cache, &lease).await
            })
        })
        .await
    }

    /// Dispatcher entry point: failures are logged and published to the
    /// originating client, never surfaced.
    pub async fn process_updates_for_doc_headless(&self, project_id: Uuid, doc_id: Uuid) {
        match self.process_updates_for_doc(project_id, doc_id).await {
            Ok(()) => {}
            Err(UpdaterError::AlreadyReported(message)) => {
                debug!(%doc_id, message, "update processing failed, client already notified");
            }
            Err(error) => {
                warn!(%doc_id, %error, "headless update processing failed");
                self.publisher.publish_error(doc_id, &error).await;
            }
        }
    }

    /// Renames the doc's project-relative path. The project-state token
    /// is invalidated before and after; the trailing invalidation runs
    /// detached so it survives caller cancellation.
    pub async fn rename_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        path_name: &str,
    ) -> Result<(), UpdaterError> {
        self.kvs.clear_project_state(project_id).await?;

        let result = self
            .with_partial_flush_retries(|| {
                self.lock.run_with_lock(doc_id, |lease| async move {
                    let mut doc = match self.kvs.get_doc(project_id, doc_id).await {
                        Ok(doc) => doc,
                        Err(CacheError::NotFound) => return Ok(()),
                        Err(error) => return Err(error.into()),
                    };
                    let mut cache = Vec::new();
                    self.drain_pending(&mut doc, &mut cache, &lease).await?;
                    self.kvs.set_path_name(doc_id, path_name).await.map_err(UpdaterError::from)
                })
            })
            .await;

        let kvs = Arc::clone(&self.kvs);
        tokio::spawn(async move {
            let invalidate = kvs.clear_project_state(project_id);
            match tokio::time::timeout(DETACHED_BUDGET, invalidate).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(%project_id, %error, "detached project-state invalidation failed")
                }
                Err(_) => warn!(%project_id, "detached project-state invalidation timed out"),
            }
        });

        result
    }

    /// Sets-or-checks the project-state token, then returns every doc in
    /// the project, soft-flushing the ones idle beyond five minutes.
    /// Contended docs are skipped.
    pub async fn get_project_docs_and_flush_if_old(
        &self,
        project_id: Uuid,
        state: &str,
    ) -> Result<Vec<Doc>, UpdaterError> {
        if self.kvs.check_or_set_project_state(project_id, state).await? {
            return Err(UpdaterError::ProjectStateChanged);
        }

        let doc_ids = self.kvs.docs_in_project(project_id).await?;
        let mut docs = Vec::with_capacity(doc_ids.len());
        for doc_id in doc_ids {
            if let Some(doc) = self.soft_flush_doc(project_id, doc_id).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Accepts tracked changes by id under the doc lock.
    pub async fn accept_changes(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        change_ids: &[String],
    ) -> Result<usize, UpdaterError> {
        self.with_partial_flush_retries(|| {
            self.lock.run_with_lock(doc_id, |lease| async move {
                let mut doc = self.get_or_load_doc(project_id, doc_id).await?;
                let mut cache = Vec::new();
                self.drain_pending(&mut doc, &mut cache, &lease).await?;

                let accepted =
                    doc.ranges.accept_changes(change_ids.iter().map(String::as_str));
                if accepted > 0 {
                    self.kvs
                        .set_ranges(doc_id, &doc.ranges, chrono::Utc::now().timestamp())
                        .await?;
                }
                Ok(accepted)
            })
        })
        .await
    }

    async fn get_or_load_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<Doc, UpdaterError> {
        match self.kvs.get_doc(project_id, doc_id).await {
            Ok(doc) => Ok(doc),
            Err(CacheError::NotFound) => self.load_doc_into_cache(project_id, doc_id).await,
            Err(error) => Err(error.into()),
        }
    }

    async fn load_doc_into_cache(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<Doc, UpdaterError> {
        let flushed = self.store.get_doc(project_id, doc_id).await?;

        // A dangling version key from an interrupted flush-and-delete may
        // run ahead of the durable copy; the higher version wins.
        let dangling = self.kvs.get_doc_version(doc_id).await?.unwrap_or(0);
        if dangling > flushed.version {
            warn!(%doc_id, dangling, flushed = flushed.version, "cached version ahead of store");
        }

        let mut doc = Doc {
            doc_id,
            project_id,
            snapshot: flushed.snapshot,
            version: flushed.version.max(dangling),
            path_name: flushed.path_name,
            ranges: flushed.ranges,
            revision: flushed.revision,
            unflushed_time: None,
            last_updated_ctx: None,
            just_loaded: false,
        };
        self.kvs.put_doc(&doc).await?;
        doc.just_loaded = true;
        Ok(doc)
    }

    /// Locked drain loop under the soft deadline.
    async fn drain_pending(
        &self,
        doc: &mut Doc,
        cache: &mut Vec<DocumentUpdate>,
        lease: &LockLease,
    ) -> Result<(), UpdaterError> {
        let deadline = soft_deadline(lease);
        loop {
            let drained = self.updates.process_outstanding_updates(doc, cache).await?;
            if drained < MAX_DRAIN {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UpdaterError::PartialFlush);
            }
        }
    }

    async fn flush_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        delete: bool,
    ) -> Result<(), UpdaterError> {
        self.with_partial_flush_retries(|| {
            self.lock.run_with_lock(doc_id, |lease| async move {
                let mut doc = match self.kvs.get_doc(project_id, doc_id).await {
                    Ok(doc) => doc,
                    // Another flusher won the race; nothing left to do.
                    Err(CacheError::NotFound) => return Ok(()),
                    Err(error) => return Err(error.into()),
                };
                let mut cache = Vec::new();
                self.drain_pending(&mut doc, &mut cache, &lease).await?;
                self.do_flush_and_maybe_delete(&mut doc, delete).await
            })
        })
        .await
    }

    async fn do_flush_and_maybe_delete(
        &self,
        doc: &mut Doc,
        delete: bool,
    ) -> Result<(), UpdaterError> {
        if doc.unflushed_time.is_some() {
            // A failed write keeps the unflushed stamp so a later flush
            // can retry.
            self.store.set_doc(doc).await?;
        }
        if delete {
            self.kvs.remove_doc(doc.project_id, doc.doc_id).await?;
        } else if doc.unflushed_time.take().is_some() {
            self.kvs.clear_unflushed_time(doc.doc_id).await?;
        }
        Ok(())
    }

    async fn for_each_project_doc(
        &self,
        project_id: Uuid,
        delete: bool,
    ) -> Result<(), UpdaterError> {
        let doc_ids = self.kvs.docs_in_project(project_id).await?;
        let mut first_error = None;
        for doc_id in doc_ids {
            let result = if delete {
                self.flush_and_delete_doc(project_id, doc_id).await
            } else {
                self.flush_doc_if_loaded(project_id, doc_id).await
            };
            if let Err(error) = result {
                warn!(%project_id, %doc_id, %error, "project flush failed for doc");
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn soft_flush_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<Option<Doc>, UpdaterError> {
        let result = self
            .lock
            .try_run_with_lock(doc_id, |lease| async move {
                let mut doc = self.get_or_load_doc(project_id, doc_id).await?;
                let mut cache = Vec::new();
                match self.drain_pending(&mut doc, &mut cache, &lease).await {
                    // The sweep is best-effort; a partial drain is fine.
                    Ok(()) | Err(UpdaterError::PartialFlush) => {}
                    Err(error) => return Err(error),
                }

                if let Some(since) = doc.unflushed_time {
                    if since <= chrono::Utc::now().timestamp() - FLUSH_IF_OLDER_THAN_SECS {
                        self.do_flush_and_maybe_delete(&mut doc, false).await?;
                    }
                }
                Ok(doc)
            })
            .await;

        match result {
            Ok(doc) => Ok(Some(doc)),
            Err(UpdaterError::Locked) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn with_partial_flush_retries<T, F, Fut>(&self, operation: F) -> Result<T, UpdaterError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpdaterError>>,
    {
        for _ in 0..MAX_PARTIAL_FLUSH_RETRIES {
            match operation().await {
                Err(UpdaterError::PartialFlush) => continue,
                other => return other,
            }
        }
        Err(UpdaterError::Internal("partial flush retries exhausted".to_owned()))
    }
}
