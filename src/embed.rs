//! The embedding surface: enqueue jobs and inspect queue state from host
//! code, independent of whether this process also runs a [`Supervisor`].
//!
//! [`Supervisor`]: crate::supervisor::Supervisor

use crate::clock::{Clock, OsRandom, Random, SystemClock};
use crate::config::KiqConfig;
use crate::error::{KiqError, KiqResult};
use crate::job::Job;
use crate::metrics;
use crate::redis::{create_pool, RedisClient};
use crate::worker::WorkerRegistry;
use serde_json::Value;
use std::sync::Arc;

/// Enqueue-time scheduling override. At most one of `in_` (a relative delay
/// in seconds) or `at` (an absolute Unix timestamp) may be set.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    pub in_: Option<f64>,
    pub at: Option<f64>,
}

impl EnqueueOptions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn in_secs(secs: f64) -> Self {
        Self {
            in_: Some(secs),
            at: None,
        }
    }

    pub fn at_secs(at: f64) -> Self {
        Self {
            in_: None,
            at: Some(at),
        }
    }

    fn resolve(self, now: f64) -> KiqResult<Option<f64>> {
        match (self.in_, self.at) {
            (Some(_), Some(_)) => Err(KiqError::Configuration(
                "enqueue options accept at most one of `in` or `at`".into(),
            )),
            (Some(delay), None) => Ok(Some(now + delay)),
            (None, Some(at)) => Ok(Some(at)),
            (None, None) => Ok(None),
        }
    }
}

/// The surface a host embeds to enqueue jobs and read queue state,
/// regardless of whether it also runs a full [`Supervisor`].
///
/// [`Supervisor`]: crate::supervisor::Supervisor
pub struct Kiq {
    redis: Arc<RedisClient>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn Random>,
    registry: Option<Arc<WorkerRegistry>>,
}

impl Kiq {
    pub fn new(redis: Arc<RedisClient>, clock: Arc<dyn Clock>, random: Arc<dyn Random>) -> Self {
        Self {
            redis,
            clock,
            random,
            registry: None,
        }
    }

    /// Attaches a worker registry so that a class's declared retry cap and
    /// unique settings are applied as defaults to jobs enqueued through this
    /// handle whenever the caller didn't supply its own
    /// `retry`/`unique_for`/`unique_until`.
    pub fn with_registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn connect(config: &KiqConfig) -> KiqResult<Self> {
        let pool = create_pool(&config.redis).await?;
        Ok(Self::new(
            Arc::new(RedisClient::new(pool)),
            Arc::new(SystemClock),
            Arc::new(OsRandom),
        ))
    }

    /// Enqueue a job supplied either as an already-assembled map of fields
    /// or a bare args value paired with a class name via
    /// [`Job::from_map_with_defaults`](crate::job::Job::from_map_with_defaults).
    /// Missing fields (`jid`, `created_at`, `queue`, `retry`) are filled with
    /// their documented defaults, falling back first to the registered
    /// worker's declared retry cap / unique settings when one is attached.
    pub async fn enqueue(&self, job_or_map: Value, options: EnqueueOptions) -> KiqResult<Job> {
        let map = match job_or_map {
            Value::Object(map) => map,
            other => {
                return Err(KiqError::Configuration(format!(
                    "job must be encoded as a JSON object, got {other}"
                )))
            }
        };

        let class_name = map
            .get("class")
            .or_else(|| map.get("module"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let descriptor = class_name
            .as_deref()
            .and_then(|class| self.registry.as_ref().and_then(|registry| registry.resolve(class)));

        let mut job = Job::from_map_with_defaults(map, self.clock.as_ref(), self.random.as_ref(), descriptor)?;
        if let Some(at) = options.resolve(self.clock.now_secs())? {
            job.at = Some(at);
        }

        let enqueued = self.redis.enqueue(&job, self.clock.as_ref()).await?;
        metrics::record_enqueued(&job.queue, &job.class);
        Ok(enqueued)
    }

    /// Remove every core-managed key. Intended for test teardown, not
    /// production use.
    pub async fn clear_all(&self) -> KiqResult<()> {
        self.redis.clear_all().await
    }

    pub async fn queue_len(&self, queue: &str) -> KiqResult<u64> {
        self.redis.queue_len(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_reject_both_in_and_at() {
        let options = EnqueueOptions {
            in_: Some(5.0),
            at: Some(10.0),
        };
        assert!(options.resolve(0.0).is_err());
    }

    #[test]
    fn in_resolves_relative_to_now() {
        let options = EnqueueOptions::in_secs(30.0);
        assert_eq!(options.resolve(100.0).unwrap(), Some(130.0));
    }

    #[test]
    fn at_resolves_to_the_given_timestamp() {
        let options = EnqueueOptions::at_secs(500.0);
        assert_eq!(options.resolve(100.0).unwrap(), Some(500.0));
    }

    #[test]
    fn no_options_resolves_to_none() {
        assert_eq!(EnqueueOptions::none().resolve(100.0).unwrap(), None);
    }
}
