// Error taxonomy for the updater. Callers pattern-match on variants,
// never on message strings.

use thiserror::Error;

use vellum_common::ot::OtError;
use vellum_docstore::DocstoreError;

use crate::kv::CacheError;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("doc not found")]
    NotFound,
    #[error("doc does not belong to the requested project")]
    NotAuthorized,
    #[error("{0}")]
    Validation(String),
    #[error("Update takes doc over max doc size")]
    BodyTooLarge,
    #[error("update range is not available in the recent-ops ring")]
    UpdateRangeNotAvailable,
    #[error("snapshot hash mismatch after apply")]
    HashMismatch,
    #[error("doc is locked by another operation")]
    Locked,
    #[error("lock wait deadline exceeded")]
    LockTimeout,
    #[error("project state changed")]
    ProjectStateChanged,
    /// The soft deadline expired mid-drain; the caller re-acquires the
    /// lock and retries. Never escapes the doc manager.
    #[error("partial flush, more updates pending")]
    PartialFlush,
    /// Already published on the applied-ops error channel; callers only log.
    #[error("{0}")]
    AlreadyReported(String),
    #[error(transparent)]
    Ot(#[from] OtError),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<CacheError> for UpdaterError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::NotFound => Self::NotFound,
            CacheError::NotAuthorized => Self::NotAuthorized,
            CacheError::UpdateRangeNotAvailable => Self::UpdateRangeNotAvailable,
            CacheError::VersionMismatch { cached, expected } => Self::Internal(format!(
                "remote version mismatches local: cached {cached}, expected {expected}"
            )),
            CacheError::Codec(error) => Self::Validation(format!("malformed cache payload: {error}")),
            CacheError::Backend(message) => Self::Internal(message),
        }
    }
}

impl From<DocstoreError> for UpdaterError {
    fn from(error: DocstoreError) -> Self {
        match error {
            DocstoreError::NotFound => Self::NotFound,
            DocstoreError::NotAuthorized => Self::NotAuthorized,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl UpdaterError {
    /// Stable code carried on the applied-ops error channel.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::NotAuthorized => "not_authorized",
            Self::Validation(_) => "validation",
            Self::BodyTooLarge => "doc_too_large",
            Self::UpdateRangeNotAvailable => "update_range_not_available",
            Self::HashMismatch => "hash_mismatch",
            Self::Locked => "locked",
            Self::LockTimeout => "lock_timeout",
            Self::ProjectStateChanged => "project_state_changed",
            Self::PartialFlush => "partial_flush",
            Self::AlreadyReported(_) => "already_reported",
            Self::Ot(_) => "ot_error",
            Self::Internal(_) => "internal",
        }
    }
}
