// Updater configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The KVS, docstore, and object-store backends are all
// selected here.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Core service configuration.
///
/// Constructed via [`UpdaterConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// `memory` or a `redis://` URL.
    pub kvs_url: String,
    /// SQLite path for the docstore; `:memory:` for an ephemeral store.
    pub docstore_path: PathBuf,
    /// `memory` or a filesystem root for archived blobs.
    pub object_store: String,
    /// Bucket name for archived doc blobs.
    pub bucket: String,
    /// Number of dirty-doc notification shards.
    pub pending_shard_count: usize,
    /// Dispatcher workers per shard.
    pub workers_per_shard: usize,
    /// Projects handled per flush-scheduler cycle.
    pub max_projects_per_cycle: usize,
    /// Producer page size for project-wide archive sweeps.
    pub archive_batch_size: usize,
    /// Concurrent per-doc archive jobs.
    pub parallel_archive_jobs: usize,
    /// How long a queued project must stay inactive before the
    /// background worker flushes and deletes it.
    pub projects_inactive_after: Duration,
    /// Base URL of the history flusher; unset disables the bridge.
    pub history_url: Option<String>,
    /// Log filter directive (e.g. `info`, `vellum_updater=debug`).
    pub log_filter: String,
    /// Identifies this instance in lock values and fan-out messages.
    pub host_id: String,
}

impl UpdaterConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `VELLUM_HOST` | `0.0.0.0` |
    /// | `VELLUM_PORT` | `3003` |
    /// | `VELLUM_KVS_URL` | `memory` |
    /// | `VELLUM_DOCSTORE_PATH` | `vellum-docstore.sqlite` |
    /// | `VELLUM_OBJECT_STORE` | `memory` |
    /// | `VELLUM_BUCKET` | `vellum-docs` |
    /// | `VELLUM_PENDING_SHARD_COUNT` | `1` |
    /// | `VELLUM_WORKERS_PER_SHARD` | `4` |
    /// | `VELLUM_MAX_PROJECTS_PER_CYCLE` | `10` |
    /// | `VELLUM_ARCHIVE_BATCH_SIZE` | `100` |
    /// | `VELLUM_PARALLEL_ARCHIVE_JOBS` | `5` |
    /// | `VELLUM_PROJECTS_INACTIVE_AFTER_SECS` | `300` |
    /// | `VELLUM_HISTORY_URL` | *(none — bridge disabled)* |
    /// | `VELLUM_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("VELLUM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("VELLUM_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(3003);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let kvs_url = env("VELLUM_KVS_URL").unwrap_or_else(|_| "memory".into());
        let docstore_path = env("VELLUM_DOCSTORE_PATH")
            .unwrap_or_else(|_| "vellum-docstore.sqlite".into())
            .into();
        let object_store = env("VELLUM_OBJECT_STORE").unwrap_or_else(|_| "memory".into());
        let bucket = env("VELLUM_BUCKET").unwrap_or_else(|_| "vellum-docs".into());

        let pending_shard_count = parse_or(&env, "VELLUM_PENDING_SHARD_COUNT", 1).max(1);
        let workers_per_shard = parse_or(&env, "VELLUM_WORKERS_PER_SHARD", 4).max(1);
        let max_projects_per_cycle = parse_or(&env, "VELLUM_MAX_PROJECTS_PER_CYCLE", 10).max(1);
        let archive_batch_size = parse_or(&env, "VELLUM_ARCHIVE_BATCH_SIZE", 100).max(1);
        let parallel_archive_jobs = parse_or(&env, "VELLUM_PARALLEL_ARCHIVE_JOBS", 5).max(1);
        let projects_inactive_after =
            Duration::from_secs(parse_or(&env, "VELLUM_PROJECTS_INACTIVE_AFTER_SECS", 300) as u64);

        let history_url = env("VELLUM_HISTORY_URL").ok().filter(|url| !url.trim().is_empty());
        let log_filter = env("VELLUM_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let hostname = env("HOSTNAME").unwrap_or_else(|_| "localhost".into());
        let host_id = format!("{hostname}:{}", std::process::id());

        Self {
            listen_addr,
            kvs_url,
            docstore_path,
            object_store,
            bucket,
            pending_shard_count,
            workers_per_shard,
            max_projects_per_cycle,
            archive_batch_size,
            parallel_archive_jobs,
            projects_inactive_after,
            history_url,
            log_filter,
            host_id,
        }
    }
}

fn parse_or<F>(env: &F, key: &str, default: usize) -> usize
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    env(key).ok().and_then(|value| value.parse().ok()).unwrap_or(default)
}
