// History bridge: marks docs with unflushed history ops and pokes the
// downstream history flusher whenever the queue crosses a multiple of
// one hundred.

use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

const FLUSH_EVERY: u64 = 100;
const FLUSH_BUDGET: Duration = Duration::from_secs(30);

/// True when pushing `appended` entries moved the history queue across a
/// multiple of one hundred.
pub fn should_flush(appended: u64, queue_depth: u64) -> bool {
    if appended == 0 {
        return false;
    }
    (queue_depth - appended) / FLUSH_EVERY != queue_depth / FLUSH_EVERY
}

#[derive(Clone)]
pub struct HistoryBridge {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HistoryBridge {
    pub fn new(base_url: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }

    /// Fire-and-forget flush request with its own budget; the pipeline
    /// never waits on the history service.
    pub fn request_flush(&self, project_id: Uuid, doc_id: Uuid) {
        let Some(base) = self.base_url.clone() else {
            debug!(%project_id, %doc_id, "history flusher not configured, skipping");
            return;
        };
        let client = self.client.clone();

        tokio::spawn(async move {
            let url = format!("{base}/project/{project_id}/doc/{doc_id}/flush");
            let request = client.post(&url).timeout(FLUSH_BUDGET).send();
            match request.await {
                Ok(response) if response.status() == reqwest::StatusCode::NO_CONTENT => {}
                Ok(response) => {
                    warn!(%url, status = %response.status(), "history flush rejected")
                }
                Err(error) => warn!(%url, %error, "history flush request failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::should_flush;

    #[test]
    fn flush_triggers_exactly_when_a_hundred_boundary_is_crossed() {
        assert!(!should_flush(0, 100));
        assert!(!should_flush(1, 99));
        assert!(should_flush(1, 100));
        assert!(!should_flush(1, 101));
        assert!(should_flush(5, 103));
        assert!(!should_flush(2, 99));
        assert!(should_flush(10, 205));
        assert!(should_flush(1, 300));
    }
}
