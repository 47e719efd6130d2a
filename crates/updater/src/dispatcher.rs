// Dispatcher: one producer per shard blocks on the shard's dirty-doc
// list and fans work into a bounded channel consumed by that shard's
// worker pool. Shutdown stops producers first; workers drain what is
// already in flight, then exit when the channel closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::kv::{Kvs, PendingKvs};
use crate::manager::DocManager;

const POP_BLOCK: Duration = Duration::from_secs(1);
const WORKER_BUDGET: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    kvs: Arc<dyn Kvs>,
    manager: Arc<DocManager>,
    workers_per_shard: usize,
}

impl Dispatcher {
    pub fn new(kvs: Arc<dyn Kvs>, manager: Arc<DocManager>, workers_per_shard: usize) -> Self {
        Self { kvs, manager, workers_per_shard: workers_per_shard.max(1) }
    }

    /// Runs until `shutdown` fires, then drains and joins everything.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        let shard_count = self.kvs.shard_count();
        info!(shard_count, workers_per_shard = self.workers_per_shard, "dispatcher started");

        let mut tasks = JoinSet::new();
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel::<String>(self.workers_per_shard * 2);
            let rx = Arc::new(Mutex::new(rx));

            let kvs = Arc::clone(&self.kvs);
            let mut producer_shutdown = shutdown.subscribe();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        biased;

                        _ = producer_shutdown.recv() => break,

                        popped = kvs.pop_dirty_doc(shard, POP_BLOCK) => match popped {
                            Ok(Some(payload)) => {
                                if tx.send(payload).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(error) => {
                                warn!(shard, %error, "dirty-doc pop failed");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        },
                    }
                }
                debug!(shard, "dispatcher producer stopped");
            });

            for _ in 0..self.workers_per_shard {
                let rx = Arc::clone(&rx);
                let manager = Arc::clone(&self.manager);
                tasks.spawn(async move {
                    loop {
                        let payload = { rx.lock().await.recv().await };
                        let Some(payload) = payload else { break };

                        let Some((project_id, doc_id)) = parse_doc_key(&payload) else {
                            warn!(payload, "malformed dirty-doc notification, dropping");
                            continue;
                        };

                        let work = manager.process_updates_for_doc_headless(project_id, doc_id);
                        if tokio::time::timeout(WORKER_BUDGET, work).await.is_err() {
                            warn!(%project_id, %doc_id, "headless processing timed out");
                        }
                    }
                });
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("dispatcher stopped");
    }
}

/// Parses a `"<projectId>:<docId>"` notification; both halves are
/// 36-character hyphenated UUIDs.
fn parse_doc_key(payload: &str) -> Option<(Uuid, Uuid)> {
    let (project, doc) = payload.split_once(':')?;
    let project_id = Uuid::parse_str(project).ok()?;
    let doc_id = Uuid::parse_str(doc).ok()?;
    Some((project_id, doc_id))
}

#[cfg(test)]
mod tests {
    use super::parse_doc_key;
    use uuid::Uuid;

    #[test]
    fn doc_keys_parse_both_uuids() {
        let project_id = Uuid::new_v4();
        let doc_id = Uuid::new_v4();
        assert_eq!(parse_doc_key(&format!("{project_id}:{doc_id}")), Some((project_id, doc_id)));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert_eq!(parse_doc_key(""), None);
        assert_eq!(parse_doc_key("no-separator"), None);
        assert_eq!(parse_doc_key("a:b"), None);
        let doc_id = Uuid::new_v4();
        assert_eq!(parse_doc_key(&format!("not-a-uuid:{doc_id}")), None);
    }
}
