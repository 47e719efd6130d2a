// Adapter to the authoritative docstore.
//
// Reads and writes retry twice with a five-second back-off, except for
// `NotFound`/`NotAuthorized` which are final. An archived doc is
// restored read-through by the archive bridge before the read retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use vellum_docstore::{ArchiveBridge, Docstore, DocstoreError, FlushedDoc, UpsertDoc};

use crate::doc::Doc;
use crate::error::UpdaterError;

const RETRY_ATTEMPTS: usize = 2;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// What the updater needs from the durable store.
#[async_trait]
pub trait FlushedDocStore: Send + Sync {
    async fn get_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<FlushedDoc, UpdaterError>;

    /// Persists the doc's current snapshot/version/ranges.
    async fn set_doc(&self, doc: &Doc) -> Result<(), UpdaterError>;
}

pub struct DocstoreBacked {
    store: Arc<Docstore>,
    bridge: Arc<ArchiveBridge>,
}

impl DocstoreBacked {
    pub fn new(store: Arc<Docstore>, bridge: Arc<ArchiveBridge>) -> Self {
        Self { store, bridge }
    }
}

fn is_final(error: &DocstoreError) -> bool {
    matches!(error, DocstoreError::NotFound | DocstoreError::NotAuthorized)
}

#[async_trait]
impl FlushedDocStore for DocstoreBacked {
    async fn get_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<FlushedDoc, UpdaterError> {
        let mut attempt = 0;
        loop {
            // The bridge restores archived content before returning.
            match self.bridge.get_full_doc(project_id, doc_id).await {
                Ok(doc) => return Ok(doc),
                Err(error) if is_final(&error) => return Err(error.into()),
                Err(error) => {
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(error.into());
                    }
                    attempt += 1;
                    warn!(%project_id, %doc_id, %error, attempt, "docstore read failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    async fn set_doc(&self, doc: &Doc) -> Result<(), UpdaterError> {
        let last_updated_at = doc
            .last_updated_ctx
            .map(|ctx| ctx.at)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let last_updated_by = doc.last_updated_ctx.and_then(|ctx| ctx.by);

        let mut attempt = 0;
        loop {
            let write = UpsertDoc {
                snapshot: &doc.snapshot,
                path_name: &doc.path_name,
                version: doc.version,
                ranges: &doc.ranges,
                last_updated_at,
                last_updated_by,
            };
            match self.store.upsert_doc(doc.project_id, doc.doc_id, write) {
                Ok(()) => return Ok(()),
                Err(error) if is_final(&error) => return Err(error.into()),
                Err(error) => {
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(error.into());
                    }
                    attempt += 1;
                    warn!(
                        project_id = %doc.project_id,
                        doc_id = %doc.doc_id,
                        %error,
                        attempt,
                        "docstore write failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }
}
