// Cold-doc archival: materialize document content as a JSON blob in
// object storage, clear the row, and restore on demand.
//
// Blob key: `<projectUuid>/<docUuid>`. Schema v1 is an object
// `{"schema_v":1,"lines":[...],"ranges":{...}}`; the legacy v0 format is
// a bare JSON array of lines with no ranges. Reads try v1 first.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use vellum_common::ranges::Ranges;

use crate::error::DocstoreError;
use crate::objstore::{ObjectStore, ObjectStoreError};
use crate::store::Docstore;

/// Bounds for project-wide archive sweeps.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLimits {
    /// Producer page size when enumerating a project's docs.
    pub batch_size: usize,
    /// Concurrent per-doc archive jobs.
    pub parallel_jobs: usize,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self { batch_size: 100, parallel_jobs: 5 }
    }
}

#[derive(Serialize, Deserialize)]
struct BlobV1 {
    schema_v: u8,
    lines: Vec<String>,
    ranges: Ranges,
}

/// Encodes document content as a v1 archive blob.
pub fn serialize_blob(lines: &[String], ranges: &Ranges) -> Result<Vec<u8>, DocstoreError> {
    let blob = BlobV1 { schema_v: 1, lines: lines.to_vec(), ranges: ranges.clone() };
    Ok(serde_json::to_vec(&blob)?)
}

/// Decodes an archive blob, accepting v1 and the legacy v0 line array.
pub fn deserialize_blob(bytes: &[u8]) -> Result<(Vec<String>, Ranges), DocstoreError> {
    if let Ok(blob) = serde_json::from_slice::<BlobV1>(bytes) {
        if blob.schema_v == 1 {
            return Ok((blob.lines, blob.ranges));
        }
    }
    if let Ok(lines) = serde_json::from_slice::<Vec<String>>(bytes) {
        return Ok((lines, Ranges::default()));
    }
    Err(DocstoreError::UnknownArchiveFormat)
}

fn blob_key(project_id: Uuid, doc_id: Uuid) -> String {
    format!("{project_id}/{doc_id}")
}

/// Read-through archival of cold documents.
pub struct ArchiveBridge {
    store: Arc<Docstore>,
    objects: Arc<dyn ObjectStore>,
    bucket: String,
    limits: ArchiveLimits,
}

impl ArchiveBridge {
    pub fn new(
        store: Arc<Docstore>,
        objects: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        limits: ArchiveLimits,
    ) -> Self {
        Self { store, objects, bucket: bucket.into(), limits }
    }

    /// Reads a doc, transparently restoring archived content first.
    pub async fn get_full_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<crate::store::FlushedDoc, DocstoreError> {
        match self.store.get_doc(project_id, doc_id) {
            Err(DocstoreError::DocArchived) => {
                self.unarchive_doc(project_id, doc_id).await?;
                self.store.get_doc(project_id, doc_id)
            }
            other => other,
        }
    }

    /// Offloads one doc's content to the object store.
    pub async fn archive_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), DocstoreError> {
        self.store.ensure_not_in_transaction()?;
        archive_one(&self.store, self.objects.as_ref(), &self.bucket, project_id, doc_id).await
    }

    /// Restores one doc's content from the object store and removes the blob.
    pub async fn unarchive_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), DocstoreError> {
        unarchive_one(&self.store, self.objects.as_ref(), &self.bucket, project_id, doc_id).await
    }

    /// Archives every doc in a project. Returns how many docs were
    /// visited; the first failure cancels outstanding jobs and surfaces.
    pub async fn archive_project(&self, project_id: Uuid) -> Result<usize, DocstoreError> {
        self.store.ensure_not_in_transaction()?;
        self.map_project_docs(project_id, Direction::Archive).await
    }

    /// Restores every archived doc in a project.
    pub async fn unarchive_project(&self, project_id: Uuid) -> Result<usize, DocstoreError> {
        self.map_project_docs(project_id, Direction::Unarchive).await
    }

    async fn map_project_docs(
        &self,
        project_id: Uuid,
        direction: Direction,
    ) -> Result<usize, DocstoreError> {
        let parallel = self.limits.parallel_jobs.max(1);
        let mut visited = 0usize;
        let mut offset = 0usize;

        loop {
            let page = self.store.project_doc_ids(project_id, self.limits.batch_size.max(1), offset)?;
            if page.is_empty() {
                return Ok(visited);
            }
            offset += page.len();

            for chunk in page.chunks(parallel) {
                let mut jobs = JoinSet::new();
                for doc_id in chunk.iter().copied() {
                    let store = Arc::clone(&self.store);
                    let objects = Arc::clone(&self.objects);
                    let bucket = self.bucket.clone();
                    jobs.spawn(async move {
                        let result = match direction {
                            Direction::Archive => {
                                archive_one(&store, objects.as_ref(), &bucket, project_id, doc_id)
                                    .await
                            }
                            Direction::Unarchive => {
                                unarchive_one(&store, objects.as_ref(), &bucket, project_id, doc_id)
                                    .await
                            }
                        };
                        (doc_id, result)
                    });
                }

                let mut first_error = None;
                while let Some(joined) = jobs.join_next().await {
                    match joined {
                        Ok((_, Ok(()))) => visited += 1,
                        Ok((doc_id, Err(error))) => {
                            warn!(%project_id, %doc_id, %error, "archive job failed");
                            if first_error.is_none() {
                                first_error = Some(error);
                                // Cancel the rest of the chunk; the loop
                                // keeps draining until the set is empty.
                                jobs.abort_all();
                            }
                        }
                        Err(join_error) if join_error.is_cancelled() => {}
                        Err(join_error) => {
                            warn!(%project_id, %join_error, "archive job panicked");
                        }
                    }
                }
                if let Some(error) = first_error {
                    return Err(error);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Archive,
    Unarchive,
}

async fn archive_one(
    store: &Docstore,
    objects: &dyn ObjectStore,
    bucket: &str,
    project_id: Uuid,
    doc_id: Uuid,
) -> Result<(), DocstoreError> {
    let doc = store.fetch_for_archiving(project_id, doc_id)?;
    if doc.archived {
        // Another archiver already moved this doc.
        return Ok(());
    }
    let lines = doc.lines.ok_or(DocstoreError::NoLines)?;

    let blob = serialize_blob(&lines, &doc.ranges)?;
    let content_size = blob.len() as u64;
    objects.send(bucket, &blob_key(project_id, doc_id), blob, content_size).await?;

    if !store.mark_archived(project_id, doc_id, doc.revision)? {
        // The doc changed while we uploaded; it stays live and the next
        // sweep re-uploads under the same key.
        debug!(%project_id, %doc_id, "doc advanced during archive, leaving live");
    }
    Ok(())
}

async fn unarchive_one(
    store: &Docstore,
    objects: &dyn ObjectStore,
    bucket: &str,
    project_id: Uuid,
    doc_id: Uuid,
) -> Result<(), DocstoreError> {
    let key = blob_key(project_id, doc_id);
    let (expected, bytes) = match objects.get(bucket, &key).await {
        Ok(found) => found,
        Err(ObjectStoreError::NotFound) => {
            // Blob gone: fine if a concurrent un-archive finished, fatal
            // if the row still claims archived content.
            return if store.is_archived(project_id, doc_id)? {
                Err(DocstoreError::NotFound)
            } else {
                Ok(())
            };
        }
        Err(error) => return Err(error.into()),
    };

    if bytes.len() as u64 != expected {
        return Err(DocstoreError::PartialDownload {
            received: bytes.len() as u64,
            expected,
        });
    }

    let (lines, ranges) = deserialize_blob(&bytes)?;
    store.restore_archived_content(project_id, doc_id, &lines, &ranges)?;
    objects.delete(bucket, &key).await?;
    Ok(())
}
