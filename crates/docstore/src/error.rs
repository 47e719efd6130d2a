use thiserror::Error;

use crate::objstore::ObjectStoreError;

/// Failure taxonomy for the authoritative store and the archive bridge.
#[derive(Debug, Error)]
pub enum DocstoreError {
    #[error("doc not found")]
    NotFound,
    #[error("doc does not belong to the requested project")]
    NotAuthorized,
    #[error("doc content is archived")]
    DocArchived,
    #[error("doc has no lines")]
    NoLines,
    #[error("partial download: received {received} of {expected} bytes")]
    PartialDownload { received: u64, expected: u64 },
    #[error("unknown archive format")]
    UnknownArchiveFormat,
    #[error("archival is not allowed inside a database transaction")]
    InTransaction,
    #[error("corrupt doc id in store: {0}")]
    CorruptId(String),
    #[error("docstore db: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("archive codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
}

impl DocstoreError {
    /// Errors that a retry cannot fix; the caller should surface these
    /// instead of backing off.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::NotAuthorized | Self::NoLines | Self::UnknownArchiveFormat
        )
    }
}
