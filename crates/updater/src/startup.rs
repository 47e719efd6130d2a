// Service wiring and lifecycle: construct the configured backends, wire
// the doc manager, spawn the dispatcher and flush scheduler, serve the
// HTTP API, and tear everything down on ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use vellum_docstore::{
    ArchiveBridge, ArchiveLimits, Docstore, FsObjectStore, MemoryObjectStore, ObjectStore,
};

use crate::api::{self, AppState};
use crate::config::UpdaterConfig;
use crate::dispatcher::Dispatcher;
use crate::flush_queue::FlushScheduler;
use crate::history::HistoryBridge;
use crate::kv::memory::MemoryKvs;
use crate::kv::redis::RedisKvs;
use crate::kv::Kvs;
use crate::lock::DocLock;
use crate::manager::DocManager;
use crate::persistence::{DocstoreBacked, FlushedDocStore};
use crate::pipeline::UpdateManager;
use crate::realtime::RealtimePublisher;

const SCHEDULER_POLL: Duration = Duration::from_secs(1);

/// Fully wired service graph.
pub struct Services {
    pub config: UpdaterConfig,
    pub kvs: Arc<dyn Kvs>,
    pub manager: Arc<DocManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<FlushScheduler>,
    pub docstore: Arc<Docstore>,
    pub archive: Arc<ArchiveBridge>,
}

impl Services {
    pub async fn build(config: UpdaterConfig) -> anyhow::Result<Self> {
        let kvs: Arc<dyn Kvs> = if config.kvs_url == "memory" {
            Arc::new(MemoryKvs::new(config.pending_shard_count))
        } else {
            Arc::new(
                RedisKvs::connect(&config.kvs_url, config.pending_shard_count)
                    .await
                    .map_err(|error| anyhow::anyhow!("kvs connect failed: {error}"))?,
            )
        };

        let docstore = if config.docstore_path.to_str() == Some(":memory:") {
            Docstore::open_in_memory()
        } else {
            Docstore::open(&config.docstore_path)
        }
        .context("failed to open docstore")?;

        let objects: Arc<dyn ObjectStore> = if config.object_store == "memory" {
            Arc::new(MemoryObjectStore::new())
        } else {
            Arc::new(FsObjectStore::new(&config.object_store))
        };

        Ok(Self::wire(config, kvs, Arc::new(docstore), objects))
    }

    /// Everything in-process; used by tests and exposed for embedding.
    pub fn build_in_memory(config: UpdaterConfig) -> anyhow::Result<(Self, Arc<MemoryKvs>)> {
        let memory = Arc::new(MemoryKvs::new(config.pending_shard_count));
        let kvs: Arc<dyn Kvs> = memory.clone();
        let docstore =
            Arc::new(Docstore::open_in_memory().context("failed to open docstore")?);
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        Ok((Self::wire(config, kvs, docstore, objects), memory))
    }

    fn wire(
        config: UpdaterConfig,
        kvs: Arc<dyn Kvs>,
        docstore: Arc<Docstore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let archive = Arc::new(ArchiveBridge::new(
            Arc::clone(&docstore),
            objects,
            config.bucket.clone(),
            ArchiveLimits {
                batch_size: config.archive_batch_size,
                parallel_jobs: config.parallel_archive_jobs,
            },
        ));
        let store: Arc<dyn FlushedDocStore> =
            Arc::new(DocstoreBacked::new(Arc::clone(&docstore), Arc::clone(&archive)));

        let publisher = RealtimePublisher::new(Arc::clone(&kvs), config.host_id.clone());
        let history = HistoryBridge::new(config.history_url.clone());
        let updates = UpdateManager::new(Arc::clone(&kvs), publisher.clone(), history);
        let lock = Arc::new(DocLock::new(Arc::clone(&kvs), config.host_id.clone()));
        let manager = Arc::new(DocManager::new(
            Arc::clone(&kvs),
            lock,
            updates,
            store,
            publisher,
        ));

        let dispatcher =
            Arc::new(Dispatcher::new(Arc::clone(&kvs), Arc::clone(&manager), config.workers_per_shard));
        let scheduler = Arc::new(FlushScheduler::new(
            Arc::clone(&kvs),
            Arc::clone(&manager),
            config.max_projects_per_cycle,
            SCHEDULER_POLL,
            config.projects_inactive_after,
        ));

        Self { config, kvs, manager, dispatcher, scheduler, docstore, archive }
    }
}

/// Runs the service until ctrl-c. Returns an error on bootstrap failure
/// so `main` can exit non-zero.
pub async fn run(config: UpdaterConfig) -> anyhow::Result<()> {
    let services = Services::build(config).await?;
    let listen_addr = services.config.listen_addr;

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let dispatcher_task = tokio::spawn(Arc::clone(&services.dispatcher).run(shutdown_tx.clone()));
    let scheduler_task = tokio::spawn(Arc::clone(&services.scheduler).run(shutdown_tx.subscribe()));

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        let _ = ctrl_c_tx.send(());
    });

    let state = AppState { manager: Arc::clone(&services.manager) };
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(%listen_addr, "vellum-updater listening");

    let mut serve_shutdown = shutdown_tx.subscribe();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.recv().await;
        })
        .await
        .context("http server exited with error")?;

    let _ = shutdown_tx.send(());
    let _ = dispatcher_task.await;
    let _ = scheduler_task.await;
    Ok(())
}
