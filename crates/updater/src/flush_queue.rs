// Background consumer of the flush-and-delete queue: pops due projects,
// flushes their docs through the docstore, and drops them from the hot
// cache. Failed projects are re-queued with fresh jitter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::kv::{DocCache, Kvs};
use crate::manager::DocManager;

pub struct FlushScheduler {
    kvs: Arc<dyn Kvs>,
    manager: Arc<DocManager>,
    /// Bound on projects handled per wake-up; the rest wait a cycle.
    max_per_cycle: usize,
    poll_interval: Duration,
    /// A queued project must stay inactive this long before it is
    /// flushed; re-queued entries get a fresh grace period.
    inactive_after: Duration,
}

impl FlushScheduler {
    pub fn new(
        kvs: Arc<dyn Kvs>,
        manager: Arc<DocManager>,
        max_per_cycle: usize,
        poll_interval: Duration,
        inactive_after: Duration,
    ) -> Self {
        Self { kvs, manager, max_per_cycle: max_per_cycle.max(1), poll_interval, inactive_after }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(max_per_cycle = self.max_per_cycle, "flush scheduler started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.drain_due_projects().await;
        }
        info!("flush scheduler stopped");
    }

    async fn drain_due_projects(&self) {
        let mut handled = 0;
        while handled < self.max_per_cycle {
            let cutoff =
                chrono::Utc::now().timestamp_millis() - self.inactive_after.as_millis() as i64;
            match self.kvs.next_project_to_flush_and_delete(cutoff).await {
                Ok(Some(project_id)) => {
                    handled += 1;
                    if let Err(error) = self.manager.flush_and_delete_project(project_id).await {
                        warn!(%project_id, %error, "queued flush-and-delete failed, re-queueing");
                        if let Err(requeue) = self.kvs.queue_flush_and_delete(project_id).await {
                            warn!(%project_id, %requeue, "re-queue failed, project dropped");
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "flush queue pop failed");
                    break;
                }
            }
        }
    }
}
