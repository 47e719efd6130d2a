// Applied-ops fan-out: confirmed updates and per-update errors flow to
// the real-time service over the KVS pub/sub channel keyed by doc.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use vellum_common::update::DocumentUpdate;

use crate::error::UpdaterError;
use crate::kv::{Kvs, Publisher};

/// Confirm publishing runs under its own fresh budget so a caller that
/// already timed out still gets its confirmations delivered.
const CONFIRM_BUDGET: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedOpsError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedOpsMessage {
    #[serde(rename = "docId")]
    pub doc_id: Uuid,
    #[serde(rename = "processedBy")]
    pub processed_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<DocumentUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AppliedOpsError>,
}

#[derive(Clone)]
pub struct RealtimePublisher {
    kvs: Arc<dyn Kvs>,
    host_id: String,
}

impl RealtimePublisher {
    pub fn new(kvs: Arc<dyn Kvs>, host_id: impl Into<String>) -> Self {
        Self { kvs, host_id: host_id.into() }
    }

    /// Publishes one confirmation per processed update, in order. Dup
    /// updates shrink to the minimal confirmation shape.
    pub async fn confirm_updates(&self, doc_id: Uuid, processed: &[DocumentUpdate]) {
        let publish_all = async {
            for update in processed {
                let update =
                    if update.is_dup() { update.dup_confirmation() } else { update.clone() };
                let message = AppliedOpsMessage {
                    doc_id,
                    processed_by: self.host_id.clone(),
                    update: Some(update),
                    error: None,
                };
                if let Err(error) = self.kvs.publish_applied_ops(doc_id, &message).await {
                    warn!(%doc_id, %error, "failed to publish update confirmation");
                    return;
                }
            }
        };
        if tokio::time::timeout(CONFIRM_BUDGET, publish_all).await.is_err() {
            warn!(%doc_id, "update confirmations timed out");
        }
    }

    /// Reports a coded error back to the originating client.
    pub async fn publish_error(&self, doc_id: Uuid, error: &UpdaterError) {
        let message = AppliedOpsMessage {
            doc_id,
            processed_by: self.host_id.clone(),
            update: None,
            error: Some(AppliedOpsError {
                message: error.to_string(),
                code: Some(error.code().to_owned()),
            }),
        };
        let publish = self.kvs.publish_applied_ops(doc_id, &message);
        match tokio::time::timeout(CONFIRM_BUDGET, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(publish_error)) => {
                warn!(%doc_id, %publish_error, "failed to publish applied-ops error")
            }
            Err(_) => warn!(%doc_id, "applied-ops error publish timed out"),
        }
    }
}
