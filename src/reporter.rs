//! The reporter chain: a single fan-in point for job lifecycle events,
//! dispatched sequentially to an ordered list of reporters that drive
//! retries, unique-lock release, backup pruning, and telemetry.

use crate::clock::{Clock, Random};
use crate::error::KiqResult;
use crate::job::{Job, UniqueUntil};
use crate::metrics;
use crate::redis::RedisClient;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A job lifecycle event, carrying the job's decoded state, its raw wire
/// payload (needed for exact-match backup-list removal), and the node that
/// owns the in-flight backup entry.
#[derive(Debug, Clone)]
pub enum Event {
    Started {
        job: Job,
        raw: String,
        node_id: String,
    },
    Success {
        job: Job,
        raw: String,
        node_id: String,
    },
    Failure {
        job: Job,
        raw: String,
        node_id: String,
        error_class: String,
        error_message: String,
    },
    /// A queue payload that could not be decoded into a `Job` at all.
    /// Carries the queue it came from since there is no `Job` to read one
    /// from.
    DecodeFailure {
        queue: String,
        raw: String,
        node_id: String,
        error_class: String,
        error_message: String,
    },
}

impl Event {
    /// The event's decoded job, if it has one. `None` for `DecodeFailure`.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Event::Started { job, .. } | Event::Success { job, .. } | Event::Failure { job, .. } => Some(job),
            Event::DecodeFailure { .. } => None,
        }
    }
}

/// A component reacting to job lifecycle events with no control over the
/// pipeline's progress. A reporter's own errors are caught and logged by
/// the chain; they never interrupt dispatch to the reporters after it.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn handle(&self, event: &Event) -> KiqResult<()>;

    /// Name used in error logs when `handle` fails.
    fn name(&self) -> &str {
        "reporter"
    }
}

/// Dispatches events to an ordered list of reporters. Order matters: the
/// retryer acknowledging the backup entry before the backup pruner runs
/// would be a double-ack, so standard reporters are ordered retryer,
/// unlocker, backup pruner, logger, then any host-supplied reporters.
pub struct ReporterChain {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl ReporterChain {
    pub fn new(reporters: Vec<Arc<dyn Reporter>>) -> Self {
        Self { reporters }
    }

    pub async fn dispatch(&self, event: Event) {
        for reporter in &self.reporters {
            if let Err(err) = reporter.handle(&event).await {
                error!(reporter = reporter.name(), error = %err, "reporter failed");
            }
        }
    }
}

/// The documented backoff formula: `15 + retry_count^4 + rand(0..30) *
/// (retry_count + 1)` seconds.
pub fn backoff_secs(retry_count: u32, random: &dyn Random) -> f64 {
    let base = 15.0 + (retry_count as f64).powi(4);
    let jitter = random.jitter(30) as f64 * (retry_count as f64 + 1.0);
    base + jitter
}

/// On failure: acknowledges and drops jobs that have exhausted their retry
/// cap, otherwise advances `retry_count`/`error_*`/`at` and re-queues the
/// job into the `retry` sorted set before acknowledging the backup entry.
pub struct Retryer {
    redis: Arc<RedisClient>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn Random>,
}

impl Retryer {
    pub fn new(redis: Arc<RedisClient>, clock: Arc<dyn Clock>, random: Arc<dyn Random>) -> Self {
        Self { redis, clock, random }
    }
}

#[async_trait]
impl Reporter for Retryer {
    async fn handle(&self, event: &Event) -> KiqResult<()> {
        let Event::Failure {
            job,
            raw,
            node_id,
            error_class,
            error_message,
        } = event
        else {
            return Ok(());
        };

        let exceeded = match job.retry.cap() {
            None => true,
            Some(cap) => job.retry_count >= cap,
        };

        if exceeded {
            self.redis.acknowledge(&job.queue, node_id, raw).await?;
            metrics::record_dead_lettered(&job.queue, &job.class);
            return Ok(());
        }

        let now = self.clock.now_secs();
        let backoff = backoff_secs(job.retry_count, self.random.as_ref());

        let mut retried = job.clone();
        retried.retry_count += 1;
        retried.failed_at = Some(job.failed_at.unwrap_or(now));
        retried.retried_at = Some(now);
        retried.error_class = Some(error_class.clone());
        retried.error_message = Some(error_message.clone());
        retried.at = Some(now + backoff);

        self.redis.retry(&retried).await?;
        self.redis.acknowledge(&job.queue, node_id, raw).await?;
        metrics::record_retried(&job.queue, &job.class);

        Ok(())
    }

    fn name(&self) -> &str {
        "retryer"
    }
}

/// Releases a job's unique lock at the point its `unique_until` setting
/// names: `"start"` releases as soon as execution begins, `"success"`
/// releases on either a successful or a failed outcome.
pub struct Unlocker {
    redis: Arc<RedisClient>,
}

impl Unlocker {
    pub fn new(redis: Arc<RedisClient>) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Reporter for Unlocker {
    async fn handle(&self, event: &Event) -> KiqResult<()> {
        match event {
            Event::Started { job, .. } if job.unique_until == Some(UniqueUntil::Start) => {
                self.redis.unlock(job).await?;
            }
            Event::Success { job, .. } | Event::Failure { job, .. }
                if job.unique_until == Some(UniqueUntil::Success) =>
            {
                self.redis.unlock(job).await?;
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "unlocker"
    }
}

/// Acknowledges (removes from the backup list) every successfully executed
/// job. Failure-path acknowledgement is the retryer's responsibility.
pub struct BackupPruner {
    redis: Arc<RedisClient>,
}

impl BackupPruner {
    pub fn new(redis: Arc<RedisClient>) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Reporter for BackupPruner {
    async fn handle(&self, event: &Event) -> KiqResult<()> {
        if let Event::Success { job, raw, node_id } = event {
            self.redis.acknowledge(&job.queue, node_id, raw).await?;
            metrics::record_acknowledged(&job.queue, &job.class);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "backup_pruner"
    }
}

/// Structured one-line logging per event.
#[derive(Default)]
pub struct Logger;

#[async_trait]
impl Reporter for Logger {
    async fn handle(&self, event: &Event) -> KiqResult<()> {
        match event {
            Event::Started { job, .. } => {
                info!(jid = %job.jid, class = %job.class, queue = %job.queue, "job started");
            }
            Event::Success { job, .. } => {
                info!(jid = %job.jid, class = %job.class, queue = %job.queue, "job succeeded");
            }
            Event::Failure {
                job,
                error_class,
                error_message,
                ..
            } => {
                warn!(
                    jid = %job.jid,
                    class = %job.class,
                    queue = %job.queue,
                    error_class = %error_class,
                    error_message = %error_message,
                    retry_count = job.retry_count,
                    "job failed"
                );
            }
            Event::DecodeFailure {
                queue,
                error_class,
                error_message,
                ..
            } => {
                warn!(
                    queue = %queue,
                    error_class = %error_class,
                    error_message = %error_message,
                    "dropping undecodable payload"
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "logger"
    }
}

/// Builds the standard reporter chain (retryer, unlocker, backup pruner,
/// logger) followed by any host-supplied extra reporters.
pub fn standard_chain(
    redis: Arc<RedisClient>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn Random>,
    extra: Vec<Arc<dyn Reporter>>,
) -> ReporterChain {
    let mut reporters: Vec<Arc<dyn Reporter>> = vec![
        Arc::new(Retryer::new(redis.clone(), clock, random)),
        Arc::new(Unlocker::new(redis.clone())),
        Arc::new(BackupPruner::new(redis)),
        Arc::new(Logger),
    ];
    reporters.extend(extra);
    ReporterChain::new(reporters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::StepRandom;

    #[test]
    fn backoff_matches_documented_formula() {
        let random = StepRandom::new("x", 17);
        let value = backoff_secs(0, &random);
        assert_eq!(value, 15.0 + 17.0);
    }

    #[test]
    fn backoff_grows_with_retry_count_fourth_power() {
        let random = StepRandom::new("x", 0);
        assert_eq!(backoff_secs(0, &random), 15.0);
        assert_eq!(backoff_secs(2, &random), 15.0 + 16.0);
    }

    #[test]
    fn backoff_falls_within_documented_range_for_scenario_four() {
        for jitter in 0..30 {
            let random = StepRandom::new("x", jitter);
            let value = backoff_secs(0, &random);
            assert!((15.0..=45.0).contains(&value));
        }
    }

    #[test]
    fn decode_failure_event_carries_no_job() {
        let event = Event::DecodeFailure {
            queue: "default".to_string(),
            raw: "not json".to_string(),
            node_id: "node-1".to_string(),
            error_class: "DecodeError".to_string(),
            error_message: "expected value".to_string(),
        };
        assert!(event.job().is_none());
    }

    #[tokio::test]
    async fn logger_handles_decode_failure_without_error() {
        let event = Event::DecodeFailure {
            queue: "default".to_string(),
            raw: "not json".to_string(),
            node_id: "node-1".to_string(),
            error_class: "DecodeError".to_string(),
            error_message: "expected value".to_string(),
        };
        assert!(Logger.handle(&event).await.is_ok());
    }

    #[tokio::test]
    async fn retryer_and_backup_pruner_ignore_decode_failure() {
        let config = crate::config::RedisConfig::default();
        let pool = deadpool_redis::Config::from_url(&config.url)
            .builder()
            .unwrap()
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .unwrap();
        let redis = Arc::new(RedisClient::new(pool));
        let retryer = Retryer::new(redis.clone(), Arc::new(crate::clock::SystemClock), Arc::new(crate::clock::OsRandom));
        let pruner = BackupPruner::new(redis);

        let event = Event::DecodeFailure {
            queue: "default".to_string(),
            raw: "not json".to_string(),
            node_id: "node-1".to_string(),
            error_class: "DecodeError".to_string(),
            error_message: "expected value".to_string(),
        };

        assert!(retryer.handle(&event).await.is_ok());
        assert!(pruner.handle(&event).await.is_ok());
    }
}
