// The live in-memory document as the updater owns it between lock
// acquisition and flush.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vellum_common::ranges::Ranges;

/// Hard bound on snapshot size; an apply that would exceed it fails the
/// update, not the doc.
pub const MAX_DOC_BYTES: usize = 2 * 1024 * 1024;

/// Last-editor context mirrored into the cache on every applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUpdatedCtx {
    /// Epoch milliseconds of the last applied update.
    pub at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Doc {
    pub doc_id: Uuid,
    pub project_id: Uuid,
    pub snapshot: String,
    pub version: u64,
    pub path_name: String,
    pub ranges: Ranges,
    /// Persistence counter of the flushed row this copy was loaded from.
    pub revision: i64,
    /// Earliest epoch second since which this copy diverged from durable
    /// state. `None` means in sync.
    pub unflushed_time: Option<i64>,
    pub last_updated_ctx: Option<LastUpdatedCtx>,
    /// Set when this call populated the cache; such docs are evicted
    /// again after one-shot operations.
    pub just_loaded: bool,
}

impl Doc {
    pub fn is_flushed(&self) -> bool {
        self.unflushed_time.is_none()
    }
}
