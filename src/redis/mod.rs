//! The only component that talks to Redis. Exposes the narrow command set
//! the rest of the engine is built on, each operation atomic from the
//! caller's perspective.

use crate::clock::Clock;
use crate::config::RedisConfig;
use crate::error::{KiqError, KiqResult};
use crate::job::Job;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tracing::info;

/// Builds the Redis keys that make up the wire-compatible layout.
pub struct RedisKeys;

impl RedisKeys {
    /// `queue:<name>` — FIFO list of JSON job envelopes.
    pub fn queue(name: &str) -> String {
        format!("queue:{name}")
    }

    /// `queues` — set of known queue names.
    pub fn queues_set() -> &'static str {
        "queues"
    }

    /// `unique:<token>` — advisory uniqueness lock.
    pub fn unique(token: &str) -> String {
        format!("unique:{token}")
    }

    /// `queue:<name>:<node_id>` — this node's in-flight backup list.
    pub fn backup(name: &str, node_id: &str) -> String {
        format!("queue:{name}:{node_id}")
    }
}

/// Create a connection pool against the configured Redis URL.
pub async fn create_pool(config: &RedisConfig) -> KiqResult<Pool> {
    info!(url = %config.url, "creating Redis connection pool");

    let cfg = Config::from_url(&config.url);
    let pool = cfg
        .builder()
        .map_err(|e| KiqError::Configuration(format!("invalid Redis config: {e}")))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| KiqError::Configuration(format!("failed to build Redis pool: {e}")))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool ready");
    Ok(pool)
}

/// Atomically moves up to `count` payloads from the tail of the queue list
/// into the head of the node's backup list, returning what it moved. This
/// is the crash-safety primitive: a payload is either in the main list, in
/// exactly one node's backup list, or acknowledged.
const DEQUEUE_SCRIPT: &str = r#"
local queue_key = KEYS[1]
local backup_key = KEYS[2]
local count = tonumber(ARGV[1])
local out = {}
for _ = 1, count do
    local payload = redis.call('RPOP', queue_key)
    if not payload then
        break
    end
    redis.call('LPUSH', backup_key, payload)
    table.insert(out, payload)
end
return out
"#;

/// Atomically migrates every due member of a scheduled set into its target
/// queue list. Guarantees at-most-one migration per entry even under
/// concurrent schedulers on different nodes.
const DESCHEDULE_SCRIPT: &str = r#"
local set_key = KEYS[1]
local now = ARGV[1]
local due = redis.call('ZRANGEBYSCORE', set_key, '-inf', now)
local moved = 0
for _, payload in ipairs(due) do
    local removed = redis.call('ZREM', set_key, payload)
    if removed == 1 then
        local ok, decoded = pcall(cjson.decode, payload)
        local queue = 'default'
        if ok and decoded['queue'] then
            queue = decoded['queue']
        end
        redis.call('LPUSH', 'queue:' .. queue, payload)
        redis.call('SADD', 'queues', queue)
        moved = moved + 1
    end
end
return moved
"#;

/// Compare-and-delete: removes the unique key only if it still belongs to
/// the given `jid`, so a racing holder's lock is never released by mistake.
const UNLOCK_SCRIPT: &str = r#"
local key = KEYS[1]
local jid = ARGV[1]
if redis.call('GET', key) == jid then
    return redis.call('DEL', key)
else
    return 0
end
"#;

/// Storage-facing client. No other component issues Redis commands.
pub struct RedisClient {
    pool: Pool,
    dequeue_script: Script,
    deschedule_script: Script,
    unlock_script: Script,
}

impl RedisClient {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            deschedule_script: Script::new(DESCHEDULE_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        }
    }

    /// Enqueue a job. Future-dated jobs go to the `schedule` set; otherwise
    /// they're pushed to the head of their queue list. A job carrying
    /// `unique_for` takes an NX+PX lock first; losing that race suppresses
    /// the enqueue and returns the existing holder's job untouched.
    pub async fn enqueue(&self, job: &Job, clock: &dyn Clock) -> KiqResult<Job> {
        let mut conn = self.pool.get().await?;

        if let (Some(ttl_ms), Some(token)) = (job.unique_for, job.unique_token.as_deref()) {
            let key = RedisKeys::unique(token);
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&job.jid)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut *conn)
                .await?;

            if acquired.is_none() {
                let holder: Option<String> = conn.get(&key).await?;
                let mut existing = job.clone();
                if let Some(holder_jid) = holder {
                    existing.jid = holder_jid;
                }
                return Ok(existing);
            }
        }

        if let Some(at) = job.at.filter(|at| *at > clock.now_secs()) {
            let payload = job.encode()?;
            let _: () = conn.zadd("schedule", payload, at).await?;
            return Ok(job.clone());
        }

        let mut enqueued = job.clone();
        enqueued.enqueued_at = Some(clock.now_secs());
        let payload = enqueued.encode()?;

        let queue_key = RedisKeys::queue(&enqueued.queue);
        let _: () = conn.lpush(&queue_key, &payload).await?;
        let _: () = conn.sadd(RedisKeys::queues_set(), &enqueued.queue).await?;

        Ok(enqueued)
    }

    /// Atomically move up to `count` raw payloads from `queue:<queue>` into
    /// `queue:<queue>:<node_id>`. Decoding is the producer's job; a
    /// malformed payload is still safely tracked in the backup list.
    pub async fn dequeue(&self, queue: &str, count: usize, node_id: &str) -> KiqResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let queue_key = RedisKeys::queue(queue);
        let backup_key = RedisKeys::backup(queue, node_id);

        let payloads: Vec<String> = self
            .dequeue_script
            .key(&queue_key)
            .key(&backup_key)
            .arg(count)
            .invoke_async(&mut *conn)
            .await?;

        Ok(payloads)
    }

    /// Remove the exact payload from its node's backup list (first
    /// occurrence from the head).
    pub async fn acknowledge(&self, queue: &str, node_id: &str, payload: &str) -> KiqResult<()> {
        let mut conn = self.pool.get().await?;
        let backup_key = RedisKeys::backup(queue, node_id);
        let _: i64 = conn.lrem(&backup_key, 1, payload).await?;
        Ok(())
    }

    /// Atomically migrate every due member of `set_name` into its target
    /// queue list. Returns the number of entries migrated.
    pub async fn deschedule(&self, set_name: &str, now: f64) -> KiqResult<u64> {
        let mut conn = self.pool.get().await?;
        let moved: u64 = self
            .deschedule_script
            .key(set_name)
            .arg(now)
            .invoke_async(&mut *conn)
            .await?;
        Ok(moved)
    }

    /// Re-insert a job (with its retry fields already updated by the
    /// caller) into the `retry` sorted set, scored by `job.at`.
    pub async fn retry(&self, job: &Job) -> KiqResult<()> {
        let mut conn = self.pool.get().await?;
        let score = job.at.ok_or_else(|| {
            KiqError::Configuration("retried job is missing its due timestamp".into())
        })?;
        let payload = job.encode()?;
        let _: () = conn.zadd("retry", payload, score).await?;
        Ok(())
    }

    /// Compare-and-delete the unique key this job holds, if any.
    pub async fn unlock(&self, job: &Job) -> KiqResult<()> {
        let Some(token) = job.unique_token.as_deref() else {
            return Ok(());
        };
        let mut conn = self.pool.get().await?;
        let key = RedisKeys::unique(token);
        let _: i64 = self
            .unlock_script
            .key(&key)
            .arg(&job.jid)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    /// The current length of a queue's main FIFO list.
    pub async fn queue_len(&self, queue: &str) -> KiqResult<u64> {
        let mut conn = self.pool.get().await?;
        let len: u64 = conn.llen(RedisKeys::queue(queue)).await?;
        Ok(len)
    }

    /// Every payload currently sitting in a node's backup list, head to
    /// tail, for crash-recovery resurrection.
    pub async fn backup_entries(&self, queue: &str, node_id: &str) -> KiqResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let entries: Vec<String> = conn.lrange(RedisKeys::backup(queue, node_id), 0, -1).await?;
        Ok(entries)
    }

    /// Resurrect every payload in a node's backup list for `queue` onto the
    /// tail of the main queue list, preserving order, then empty the
    /// backup list.
    pub async fn resurrect(&self, queue: &str, node_id: &str) -> KiqResult<usize> {
        let entries = self.backup_entries(queue, node_id).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let queue_key = RedisKeys::queue(queue);
        for payload in &entries {
            let _: () = conn.rpush(&queue_key, payload).await?;
        }
        let _: () = conn.del(RedisKeys::backup(queue, node_id)).await?;
        Ok(entries.len())
    }

    /// The set of queue names any enqueue has ever registered.
    pub async fn known_queues(&self) -> KiqResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let queues: Vec<String> = conn.smembers(RedisKeys::queues_set()).await?;
        Ok(queues)
    }

    /// Remove every core-managed key: queue lists, backup lists, both
    /// scheduled sets, unique locks, and the known-queues set itself.
    pub async fn clear_all(&self) -> KiqResult<()> {
        let mut conn = self.pool.get().await?;

        let queues = self.known_queues().await?;
        for queue in &queues {
            let _: () = conn.del(RedisKeys::queue(queue)).await?;
        }

        let backup_keys: Vec<String> = redis::cmd("KEYS").arg("queue:*:*").query_async(&mut *conn).await?;
        if !backup_keys.is_empty() {
            let _: () = conn.del(&backup_keys).await?;
        }

        let unique_keys: Vec<String> = redis::cmd("KEYS").arg("unique:*").query_async(&mut *conn).await?;
        if !unique_keys.is_empty() {
            let _: () = conn.del(&unique_keys).await?;
        }

        let _: () = conn.del("schedule").await?;
        let _: () = conn.del("retry").await?;
        let _: () = conn.del(RedisKeys::queues_set()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_wire_format() {
        assert_eq!(RedisKeys::queue("default"), "queue:default");
        assert_eq!(RedisKeys::unique("abc123"), "unique:abc123");
        assert_eq!(RedisKeys::backup("default", "node-1"), "queue:default:node-1");
        assert_eq!(RedisKeys::queues_set(), "queues");
    }
}
