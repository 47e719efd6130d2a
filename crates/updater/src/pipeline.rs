// The update pipeline: drain pending updates, rebase them against the
// recent-ops ring, apply, commit to the hot cache, and confirm on the
// fan-out channel.

use std::sync::Arc;

use tracing::debug;

use vellum_common::ot::{apply, content_hash_hex, transform, Side};
use vellum_common::update::DocumentUpdate;

use crate::doc::{Doc, LastUpdatedCtx, MAX_DOC_BYTES};
use crate::error::UpdaterError;
use crate::history::{should_flush, HistoryBridge};
use crate::kv::{DocCache, Kvs, PendingKvs};
use crate::realtime::RealtimePublisher;

/// At most this many pending updates come off the queue per pass.
pub const MAX_DRAIN: usize = 10;

/// The transform cache never grows past the ring size.
pub const TRANSFORM_CACHE_MAX: usize = 100;

pub struct UpdateManager {
    kvs: Arc<dyn Kvs>,
    publisher: RealtimePublisher,
    history: HistoryBridge,
}

impl UpdateManager {
    pub fn new(kvs: Arc<dyn Kvs>, publisher: RealtimePublisher, history: HistoryBridge) -> Self {
        Self { kvs, publisher, history }
    }

    /// One drain pass. Returns how many updates came off the queue;
    /// zero means the queue was empty.
    ///
    /// A failing update is reported on the applied-ops channel and stops
    /// the batch: later entries assumed it applied. Updates processed
    /// before the failure are still committed and confirmed.
    pub async fn process_outstanding_updates(
        &self,
        doc: &mut Doc,
        cache: &mut Vec<DocumentUpdate>,
    ) -> Result<usize, UpdaterError> {
        let mut pending = self.kvs.drain_updates(doc.doc_id, MAX_DRAIN).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let drained = pending.len();

        let now_ms = chrono::Utc::now().timestamp_millis();
        for update in &mut pending {
            update.meta.ingestion_time.get_or_insert(now_ms);
            if update.version > doc.version {
                return Err(UpdaterError::Validation(format!(
                    "update version {} is ahead of doc version {}",
                    update.version, doc.version
                )));
            }
        }

        // Make the transform cache cover every missed version.
        let min_version = pending.iter().map(|u| u.version).min().unwrap_or(doc.version);
        let max_version = cache.first().map(|entry| entry.version).unwrap_or(doc.version);
        if min_version < max_version {
            let missed = self
                .kvs
                .get_previous_doc_updates(doc.doc_id, min_version, max_version)
                .await?;
            let tail = std::mem::take(cache);
            cache.extend(missed);
            cache.extend(tail);
        }

        let mut processed = Vec::with_capacity(drained);
        let mut failed = None;
        for update in pending {
            match apply_update(doc, cache, update) {
                Ok(update) => processed.push(update),
                Err(error) => {
                    debug!(doc_id = %doc.doc_id, %error, "update failed to apply");
                    self.publisher.publish_error(doc.doc_id, &error).await;
                    failed = Some(UpdaterError::AlreadyReported(error.to_string()));
                    break;
                }
            }
        }

        self.persist_processed_updates(doc, &processed).await?;

        match failed {
            Some(error) => Err(error),
            None => Ok(drained),
        }
    }

    /// Commits applied updates to the cache and confirms every processed
    /// entry (dups included) on the fan-out channel.
    pub async fn persist_processed_updates(
        &self,
        doc: &mut Doc,
        processed: &[DocumentUpdate],
    ) -> Result<(), UpdaterError> {
        let applied: Vec<DocumentUpdate> =
            processed.iter().filter(|update| !update.is_dup()).cloned().collect();

        if !applied.is_empty() {
            let depth = self.kvs.update_document(doc, &applied).await?;
            self.kvs.record_doc_has_history(doc.project_id, doc.doc_id).await?;
            if should_flush(applied.len() as u64, depth) {
                self.history.request_flush(doc.project_id, doc.doc_id);
            }
        }

        if !processed.is_empty() {
            self.publisher.confirm_updates(doc.doc_id, processed).await;
        }
        Ok(())
    }
}

/// Rebases one update against the cache tail, applies it, and commits it
/// to the local doc. The doc is untouched when the update fails or turns
/// out to be a duplicate.
pub(crate) fn apply_update(
    doc: &mut Doc,
    cache: &mut Vec<DocumentUpdate>,
    mut update: DocumentUpdate,
) -> Result<DocumentUpdate, UpdaterError> {
    if update.version > doc.version {
        return Err(UpdaterError::Validation(format!(
            "update version {} is ahead of doc version {}",
            update.version, doc.version
        )));
    }
    let behind = (doc.version - update.version) as usize;
    if cache.len() < behind {
        return Err(UpdaterError::UpdateRangeNotAvailable);
    }
    let offset = cache.len() - behind;

    let mut transformed = false;
    for entry in cache[offset..].iter() {
        if let Some(sources) = &update.dup_if_source {
            if sources.iter().any(|source| source == &entry.meta.source) {
                update.dup = Some(true);
                return Ok(update);
            }
        }
        update.op = transform(&update.op, &entry.op, Side::Left)?;
        update.version += 1;
        transformed = true;
    }

    let new_snapshot = apply(&doc.snapshot, &update.op)?;
    if new_snapshot.len() > MAX_DOC_BYTES {
        return Err(UpdaterError::BodyTooLarge);
    }
    if !transformed {
        if let Some(expected) = &update.hash {
            if expected != &content_hash_hex(&new_snapshot) {
                return Err(UpdaterError::HashMismatch);
            }
        }
    }

    doc.snapshot = new_snapshot;
    doc.version += 1;
    doc.last_updated_ctx = Some(LastUpdatedCtx {
        at: update.meta.ingestion_time.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        by: update.meta.user_id,
    });

    cache.push(update.clone());
    if cache.len() > TRANSFORM_CACHE_MAX {
        let excess = cache.len() - TRANSFORM_CACHE_MAX;
        cache.drain(..excess);
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use vellum_common::ot::content_hash_hex;
    use vellum_common::ranges::Ranges;
    use vellum_common::update::{Component, DocumentUpdate, UpdateMeta};

    use super::UpdateManager;
    use crate::doc::Doc;
    use crate::error::UpdaterError;
    use crate::history::HistoryBridge;
    use crate::kv::memory::MemoryKvs;
    use crate::kv::{DocCache, Kvs, PendingKvs};
    use crate::realtime::RealtimePublisher;

    fn manager(kvs: &Arc<MemoryKvs>) -> UpdateManager {
        let kvs = kvs.clone() as Arc<dyn Kvs>;
        let publisher = RealtimePublisher::new(Arc::clone(&kvs), "test-host");
        UpdateManager::new(kvs, publisher, HistoryBridge::new(None))
    }

    fn doc(snapshot: &str, version: u64) -> Doc {
        Doc {
            doc_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            snapshot: snapshot.to_owned(),
            version,
            path_name: "/main.tex".to_owned(),
            ranges: Ranges::default(),
            revision: 1,
            unflushed_time: None,
            last_updated_ctx: None,
            just_loaded: false,
        }
    }

    fn update(doc_id: Uuid, version: u64, op: Vec<Component>, source: &str) -> DocumentUpdate {
        DocumentUpdate {
            doc_id,
            version,
            op,
            hash: None,
            dup: None,
            dup_if_source: None,
            meta: UpdateMeta { source: source.to_owned(), ..UpdateMeta::default() },
        }
    }

    #[tokio::test]
    async fn applies_an_insert_and_stamps_the_doc() {
        let kvs = Arc::new(MemoryKvs::new(1));
        let pipeline = manager(&kvs);
        let mut live = doc("foo", 3);
        kvs.put_doc(&live).await.expect("put should succeed");

        kvs.push_update(
            live.project_id,
            live.doc_id,
            &update(live.doc_id, 3, vec![Component::insertion("X", 0)], "c1"),
        )
        .await
        .expect("push should succeed");

        let mut cache = Vec::new();
        let drained = pipeline
            .process_outstanding_updates(&mut live, &mut cache)
            .await
            .expect("pass should succeed");

        assert_eq!(drained, 1);
        assert_eq!(live.snapshot, "Xfoo");
        assert_eq!(live.version, 4);
        assert!(live.unflushed_time.is_some());
        assert_eq!(cache.len(), 1);

        // The committed update landed in the ring at version 3.
        let ring = kvs
            .get_previous_doc_updates(live.doc_id, 3, 4)
            .await
            .expect("ring should serve the update");
        assert_eq!(ring.len(), 1);
        assert_eq!(ring[0].version, 3);
    }

    #[tokio::test]
    async fn deletion_mismatch_publishes_a_coded_error_and_leaves_the_doc_alone() {
        let kvs = Arc::new(MemoryKvs::new(1));
        let mut events = kvs.subscribe();
        let pipeline = manager(&kvs);
        let mut live = doc("fooBar", 5);
        kvs.put_doc(&live).await.expect("put should succeed");

        kvs.push_update(
            live.project_id,
            live.doc_id,
            &update(live.doc_id, 5, vec![Component::deletion("bar", 3)], "c1"),
        )
        .await
        .expect("push should succeed");

        let mut cache = Vec::new();
        let error = pipeline
            .process_outstanding_updates(&mut live, &mut cache)
            .await
            .expect_err("mismatched delete should fail");
        assert!(matches!(error, UpdaterError::AlreadyReported(_)));
        assert!(error
            .to_string()
            .contains("Delete component 'bar' does not match deleted text 'Bar'"));

        assert_eq!(live.snapshot, "fooBar");
        assert_eq!(live.version, 5);
        assert_eq!(live.unflushed_time, None);

        let event = events.recv().await.expect("an error should be published");
        let message: serde_json::Value =
            serde_json::from_str(&event.payload).expect("payload should parse");
        assert_eq!(message["error"]["code"], "ot_error");
    }

    #[tokio::test]
    async fn stale_update_is_transformed_through_the_ring() {
        let kvs = Arc::new(MemoryKvs::new(1));
        let pipeline = manager(&kvs);

        // Ring: u10 inserted "X"@1 into "AB", producing "AXB" at v11.
        let mut live = doc("AB", 10);
        kvs.put_doc(&live).await.expect("put should succeed");
        let u10 = update(live.doc_id, 10, vec![Component::insertion("X", 1)], "other");
        live.snapshot = "AXB".to_owned();
        live.version = 11;
        kvs.update_document(&mut live, &[u10]).await.expect("seed commit should succeed");

        // A client still at v10 inserts "Y"@2 (after "B" in its view).
        kvs.push_update(
            live.project_id,
            live.doc_id,
            &update(live.doc_id, 10, vec![Component::insertion("Y", 2)], "c1"),
        )
        .await
        .expect("push should succeed");

        let mut cache = Vec::new();
        pipeline
            .process_outstanding_updates(&mut live, &mut cache)
            .await
            .expect("pass should succeed");

        assert_eq!(live.snapshot, "AXBY");
        assert_eq!(live.version, 12);
        let committed = kvs
            .get_previous_doc_updates(live.doc_id, 11, 12)
            .await
            .expect("ring should serve the transformed update");
        assert_eq!(committed[0].op, vec![Component::insertion("Y", 3)]);
    }

    #[tokio::test]
    async fn dup_if_source_swallows_the_echo_and_confirms_minimally() {
        let kvs = Arc::new(MemoryKvs::new(1));
        let mut events = kvs.subscribe();
        let pipeline = manager(&kvs);

        let mut live = doc("hell", 6);
        kvs.put_doc(&live).await.expect("put should succeed");
        let seed = update(live.doc_id, 6, vec![Component::insertion("o", 4)], "sess-A");
        live.snapshot = "hello".to_owned();
        live.version = 7;
        kvs.update_document(&mut live, &[seed]).await.expect("seed commit should succeed");

        let mut echo = update(live.doc_id, 6, vec![Component::insertion("!", 5)], "sess-B");
        echo.dup_if_source = Some(vec!["sess-A".to_owned()]);
        kvs.push_update(live.project_id, live.doc_id, &echo).await.expect("push should succeed");

        let mut cache = Vec::new();
        pipeline
            .process_outstanding_updates(&mut live, &mut cache)
            .await
            .expect("pass should succeed");

        // Version and snapshot unchanged; the echo never applied.
        assert_eq!(live.snapshot, "hello");
        assert_eq!(live.version, 7);

        let event = events.recv().await.expect("a confirmation should be published");
        let message: serde_json::Value =
            serde_json::from_str(&event.payload).expect("payload should parse");
        assert_eq!(message["update"]["dup"], true);
        assert!(message["update"].get("op").is_none());
    }

    #[tokio::test]
    async fn hash_check_gates_untransformed_updates() {
        let kvs = Arc::new(MemoryKvs::new(1));
        let pipeline = manager(&kvs);
        let mut live = doc("foo", 3);
        kvs.put_doc(&live).await.expect("put should succeed");

        let mut good = update(live.doc_id, 3, vec![Component::insertion("X", 0)], "c1");
        good.hash = Some(content_hash_hex("Xfoo"));
        kvs.push_update(live.project_id, live.doc_id, &good).await.expect("push should succeed");
        let mut cache = Vec::new();
        pipeline
            .process_outstanding_updates(&mut live, &mut cache)
            .await
            .expect("matching hash should pass");
        assert_eq!(live.snapshot, "Xfoo");

        let mut bad = update(live.doc_id, 4, vec![Component::insertion("Y", 0)], "c1");
        bad.hash = Some(content_hash_hex("not the snapshot"));
        kvs.push_update(live.project_id, live.doc_id, &bad).await.expect("push should succeed");
        let error = pipeline
            .process_outstanding_updates(&mut live, &mut cache)
            .await
            .expect_err("hash mismatch should fail");
        assert!(matches!(error, UpdaterError::AlreadyReported(_)));
        assert_eq!(live.snapshot, "Xfoo");
        assert_eq!(live.version, 4);
    }

    #[tokio::test]
    async fn future_versions_fail_the_batch_fatally() {
        let kvs = Arc::new(MemoryKvs::new(1));
        let pipeline = manager(&kvs);
        let mut live = doc("foo", 3);
        kvs.put_doc(&live).await.expect("put should succeed");

        kvs.push_update(
            live.project_id,
            live.doc_id,
            &update(live.doc_id, 9, vec![Component::insertion("X", 0)], "c1"),
        )
        .await
        .expect("push should succeed");

        let mut cache = Vec::new();
        let error = pipeline
            .process_outstanding_updates(&mut live, &mut cache)
            .await
            .expect_err("future version should fail");
        assert!(matches!(error, UpdaterError::Validation(_)));
    }
}
