// Redis KVS backend.
//
// Every round-trip is bounded to five seconds. Multi-key contracts run
// as MULTI/EXEC pipelines; the ring range read and the queue pop use
// small Lua scripts where a server-side check must be atomic with the
// read. Per-doc writes are additionally serialized by the doc lock, so
// the version pre-check in `update_document` stays a plain GET.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use vellum_common::ranges::Ranges;
use vellum_common::update::DocumentUpdate;

use crate::doc::Doc;
use crate::kv::{
    keys, CacheError, DocCache, DocCore, LockKvs, PendingKvs, Publisher, ReleaseOutcome,
    DOC_OPS_MAX, DOC_OPS_TTL,
};
use crate::realtime::AppliedOpsMessage;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const PREVIOUS_UPDATES_SCRIPT: &str = r#"
local version = redis.call('GET', KEYS[1])
if not version then
    return -1
end
version = tonumber(version)
local length = redis.call('LLEN', KEYS[2])
local first = version - length
local start = tonumber(ARGV[1])
local stop = tonumber(ARGV[2])
if start < first or stop > version or start > stop then
    return -2
end
if start == stop then
    return {}
end
return redis.call('LRANGE', KEYS[2], start - first, stop - first - 1)
"#;

const POP_QUEUE_SCRIPT: &str = r#"
local entries = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #entries == 0 then
    return false
end
redis.call('ZREM', KEYS[1], entries[1])
return entries[1]
"#;

pub struct RedisKvs {
    manager: ConnectionManager,
    shard_count: usize,
}

impl RedisKvs {
    pub async fn connect(url: &str, shard_count: usize) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let manager = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self { manager, shard_count: shard_count.max(1) })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn backend(error: redis::RedisError) -> CacheError {
    CacheError::Backend(error.to_string())
}

async fn bounded<T>(
    future: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> Result<T, CacheError> {
    match tokio::time::timeout(REQUEST_TIMEOUT, future).await {
        Ok(result) => result.map_err(backend),
        Err(_) => Err(CacheError::Backend("kvs request timed out".to_owned())),
    }
}

fn decode_updates(raw: Vec<String>) -> Result<Vec<DocumentUpdate>, CacheError> {
    raw.iter().map(|entry| serde_json::from_str(entry).map_err(CacheError::from)).collect()
}

#[async_trait]
impl LockKvs for RedisKvs {
    async fn try_acquire(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        let reply: redis::Value = bounded(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn),
        )
        .await?;
        Ok(!matches!(reply, redis::Value::Nil))
    }

    async fn release(&self, key: &str, value: &str) -> Result<ReleaseOutcome, CacheError> {
        let mut conn = self.conn();
        let deleted: i64 = bounded(
            Script::new(RELEASE_SCRIPT).key(key).arg(value).invoke_async(&mut conn),
        )
        .await?;
        if deleted > 0 {
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::NotHeld)
        }
    }
}

#[async_trait]
impl DocCache for RedisKvs {
    async fn put_doc(&self, doc: &Doc) -> Result<(), CacheError> {
        let core = serde_json::to_string(&DocCore::from_doc(doc))?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(keys::doc_core(doc.doc_id))
            .arg(core)
            .ignore()
            .cmd("SET")
            .arg(keys::doc_version(doc.doc_id))
            .arg(doc.version)
            .ignore();
        match doc.unflushed_time {
            Some(at) => {
                pipe.cmd("SET").arg(keys::unflushed_time(doc.doc_id)).arg(at).ignore();
            }
            None => {
                pipe.cmd("DEL").arg(keys::unflushed_time(doc.doc_id)).ignore();
            }
        }
        pipe.cmd("SADD")
            .arg(keys::docs_in_project(doc.project_id))
            .arg(doc.doc_id.to_string())
            .ignore();

        let mut conn = self.conn();
        bounded(pipe.query_async::<_, ()>(&mut conn)).await
    }

    async fn get_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<Doc, CacheError> {
        let mut conn = self.conn();
        let (core, version, unflushed_time, ctx): (
            Option<String>,
            Option<u64>,
            Option<i64>,
            Option<String>,
        ) = bounded(
            redis::pipe()
                .atomic()
                .cmd("GET")
                .arg(keys::doc_core(doc_id))
                .cmd("GET")
                .arg(keys::doc_version(doc_id))
                .cmd("GET")
                .arg(keys::unflushed_time(doc_id))
                .cmd("GET")
                .arg(keys::last_updated_ctx(doc_id))
                .query_async(&mut conn),
        )
        .await?;

        let core: DocCore = match core {
            Some(raw) => serde_json::from_str(&raw)?,
            None => return Err(CacheError::NotFound),
        };
        if core.project_id != project_id {
            return Err(CacheError::NotAuthorized);
        }
        let last_updated_ctx = ctx.and_then(|raw| serde_json::from_str(&raw).ok());
        Ok(core.into_doc(doc_id, version.unwrap_or(0), unflushed_time, last_updated_ctx))
    }

    async fn get_doc_version(&self, doc_id: Uuid) -> Result<Option<u64>, CacheError> {
        let mut conn = self.conn();
        bounded(redis::cmd("GET").arg(keys::doc_version(doc_id)).query_async(&mut conn)).await
    }

    async fn update_document(
        &self,
        doc: &mut Doc,
        applied: &[DocumentUpdate],
    ) -> Result<u64, CacheError> {
        let mut conn = self.conn();

        let cached: Option<u64> = bounded(
            redis::cmd("GET").arg(keys::doc_version(doc.doc_id)).query_async(&mut conn),
        )
        .await?;
        let cached = cached.ok_or(CacheError::NotFound)?;
        let expected = doc.version - applied.len() as u64;
        if cached != expected {
            return Err(CacheError::VersionMismatch { cached, expected });
        }

        let core = serde_json::to_string(&DocCore::from_doc(doc))?;
        let mut encoded = Vec::with_capacity(applied.len());
        for update in applied {
            encoded.push(serde_json::to_string(update)?);
        }
        let now_secs = chrono::Utc::now().timestamp();
        let ops_key = keys::doc_ops(doc.doc_id);
        let history_key = keys::uncompressed_history_ops(doc.doc_id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(keys::doc_core(doc.doc_id))
            .arg(core)
            .ignore()
            .cmd("SET")
            .arg(keys::doc_version(doc.doc_id))
            .arg(doc.version)
            .ignore();
        if let Some(ctx) = doc.last_updated_ctx {
            pipe.cmd("SET")
                .arg(keys::last_updated_ctx(doc.doc_id))
                .arg(serde_json::to_string(&ctx)?)
                .ignore();
        }
        pipe.cmd("LTRIM").arg(&ops_key).arg(-(DOC_OPS_MAX as i64)).arg(-1).ignore();
        for entry in &encoded {
            pipe.cmd("RPUSH").arg(&ops_key).arg(entry).ignore();
        }
        pipe.cmd("PEXPIRE").arg(&ops_key).arg(DOC_OPS_TTL.as_millis() as u64).ignore();
        for entry in &encoded {
            pipe.cmd("RPUSH").arg(&history_key).arg(entry).ignore();
        }
        pipe.cmd("SET").arg(keys::unflushed_time(doc.doc_id)).arg(now_secs).arg("NX").ignore();
        bounded(pipe.query_async::<_, ()>(&mut conn)).await?;

        let depth: u64 =
            bounded(redis::cmd("LLEN").arg(&history_key).query_async(&mut conn)).await?;
        let unflushed: Option<i64> = bounded(
            redis::cmd("GET").arg(keys::unflushed_time(doc.doc_id)).query_async(&mut conn),
        )
        .await?;
        doc.unflushed_time = unflushed;

        Ok(depth)
    }

    async fn get_previous_doc_updates(
        &self,
        doc_id: Uuid,
        start: u64,
        end: u64,
    ) -> Result<Vec<DocumentUpdate>, CacheError> {
        let mut conn = self.conn();
        let reply: redis::Value = bounded(
            Script::new(PREVIOUS_UPDATES_SCRIPT)
                .key(keys::doc_version(doc_id))
                .key(keys::doc_ops(doc_id))
                .arg(start)
                .arg(end)
                .invoke_async(&mut conn),
        )
        .await?;

        let raw: Vec<String> = match reply {
            redis::Value::Int(-1) => return Err(CacheError::NotFound),
            redis::Value::Int(-2) => return Err(CacheError::UpdateRangeNotAvailable),
            other => redis::FromRedisValue::from_redis_value(&other).map_err(backend)?,
        };
        let updates = decode_updates(raw)?;

        if let Some(first_update) = updates.first() {
            if first_update.version != start {
                return Err(CacheError::UpdateRangeNotAvailable);
            }
        }
        Ok(updates)
    }

    async fn remove_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), CacheError> {
        let mut conn = self.conn();
        bounded(
            redis::pipe()
                .atomic()
                .cmd("DEL")
                .arg(keys::doc_core(doc_id))
                .arg(keys::doc_version(doc_id))
                .arg(keys::unflushed_time(doc_id))
                .arg(keys::last_updated_ctx(doc_id))
                .arg(keys::doc_ops(doc_id))
                .ignore()
                .cmd("SREM")
                .arg(keys::docs_in_project(project_id))
                .arg(doc_id.to_string())
                .ignore()
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn clear_unflushed_time(&self, doc_id: Uuid) -> Result<(), CacheError> {
        let mut conn = self.conn();
        bounded(
            redis::cmd("DEL").arg(keys::unflushed_time(doc_id)).query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn set_path_name(&self, doc_id: Uuid, path_name: &str) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let raw: Option<String> =
            bounded(redis::cmd("GET").arg(keys::doc_core(doc_id)).query_async(&mut conn)).await?;
        let mut core: DocCore = match raw {
            Some(raw) => serde_json::from_str(&raw)?,
            None => return Err(CacheError::NotFound),
        };
        core.path_name = path_name.to_owned();
        bounded(
            redis::cmd("SET")
                .arg(keys::doc_core(doc_id))
                .arg(serde_json::to_string(&core)?)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn set_ranges(
        &self,
        doc_id: Uuid,
        ranges: &Ranges,
        now_secs: i64,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let raw: Option<String> =
            bounded(redis::cmd("GET").arg(keys::doc_core(doc_id)).query_async(&mut conn)).await?;
        let mut core: DocCore = match raw {
            Some(raw) => serde_json::from_str(&raw)?,
            None => return Err(CacheError::NotFound),
        };
        core.ranges = ranges.clone();
        bounded(
            redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(keys::doc_core(doc_id))
                .arg(serde_json::to_string(&core)?)
                .ignore()
                .cmd("SET")
                .arg(keys::unflushed_time(doc_id))
                .arg(now_secs)
                .arg("NX")
                .ignore()
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn docs_in_project(&self, project_id: Uuid) -> Result<Vec<Uuid>, CacheError> {
        let mut conn = self.conn();
        let members: Vec<String> = bounded(
            redis::cmd("SMEMBERS").arg(keys::docs_in_project(project_id)).query_async(&mut conn),
        )
        .await?;
        members
            .into_iter()
            .map(|raw| {
                Uuid::parse_str(&raw)
                    .map_err(|_| CacheError::Backend(format!("corrupt doc id in project set: {raw}")))
            })
            .collect()
    }

    async fn queue_flush_and_delete(&self, project_id: Uuid) -> Result<(), CacheError> {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1000.0);
        let score = chrono::Utc::now().timestamp_millis() as f64 + jitter;
        let mut conn = self.conn();
        bounded(
            redis::cmd("ZADD")
                .arg(keys::FLUSH_AND_DELETE_QUEUE)
                .arg(score)
                .arg(project_id.to_string())
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn next_project_to_flush_and_delete(
        &self,
        cutoff_ms: i64,
    ) -> Result<Option<Uuid>, CacheError> {
        let mut conn = self.conn();
        let popped: Option<String> = bounded(
            Script::new(POP_QUEUE_SCRIPT)
                .key(keys::FLUSH_AND_DELETE_QUEUE)
                .arg(cutoff_ms)
                .invoke_async(&mut conn),
        )
        .await?;
        match popped {
            Some(raw) => Uuid::parse_str(&raw).map(Some).map_err(|_| {
                CacheError::Backend(format!("corrupt project id in flush queue: {raw}"))
            }),
            None => Ok(None),
        }
    }

    async fn check_or_set_project_state(
        &self,
        project_id: Uuid,
        state_token: &str,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        let previous: Option<String> = bounded(
            redis::cmd("GETSET")
                .arg(keys::project_state(project_id))
                .arg(state_token)
                .query_async(&mut conn),
        )
        .await?;
        Ok(previous.as_deref() != Some(state_token))
    }

    async fn clear_project_state(&self, project_id: Uuid) -> Result<(), CacheError> {
        let mut conn = self.conn();
        bounded(
            redis::cmd("DEL").arg(keys::project_state(project_id)).query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn record_doc_has_history(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn();
        bounded(
            redis::cmd("SADD")
                .arg(keys::docs_with_history_ops(project_id))
                .arg(doc_id.to_string())
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }
}

#[async_trait]
impl PendingKvs for RedisKvs {
    async fn push_update(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        update: &DocumentUpdate,
    ) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(update)?;
        let shard = rand::thread_rng().gen_range(0..self.shard_count);
        let mut conn = self.conn();
        bounded(
            redis::pipe()
                .atomic()
                .cmd("RPUSH")
                .arg(keys::pending_updates(doc_id))
                .arg(encoded)
                .ignore()
                .cmd("RPUSH")
                .arg(keys::pending_shard(shard))
                .arg(format!("{project_id}:{doc_id}"))
                .ignore()
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn drain_updates(
        &self,
        doc_id: Uuid,
        max: usize,
    ) -> Result<Vec<DocumentUpdate>, CacheError> {
        let key = keys::pending_updates(doc_id);
        let mut conn = self.conn();
        let (raw,): (Vec<String>,) = bounded(
            redis::pipe()
                .atomic()
                .cmd("LRANGE")
                .arg(&key)
                .arg(0)
                .arg(max as i64 - 1)
                .cmd("LTRIM")
                .arg(&key)
                .arg(max as i64)
                .arg(-1)
                .ignore()
                .query_async(&mut conn),
        )
        .await?;
        decode_updates(raw)
    }

    async fn pop_dirty_doc(
        &self,
        shard: usize,
        timeout: Duration,
    ) -> Result<Option<String>, CacheError> {
        let key = keys::pending_shard(shard % self.shard_count);
        let block_secs = timeout.as_secs().max(1);
        let mut conn = self.conn();

        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(&key).arg(block_secs);
        let future = cmd.query_async(&mut conn);
        let reply: Option<(String, String)> =
            match tokio::time::timeout(timeout + REQUEST_TIMEOUT, future).await {
                Ok(result) => result.map_err(backend)?,
                Err(_) => return Err(CacheError::Backend("blpop timed out".to_owned())),
            };
        Ok(reply.map(|(_, payload)| payload))
    }

    fn shard_count(&self) -> usize {
        self.shard_count
    }
}

#[async_trait]
impl Publisher for RedisKvs {
    async fn publish_applied_ops(
        &self,
        doc_id: Uuid,
        message: &AppliedOpsMessage,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn();
        bounded(
            redis::cmd("PUBLISH")
                .arg(keys::applied_ops_channel(doc_id))
                .arg(payload)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }
}
