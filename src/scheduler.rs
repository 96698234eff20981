//! Periodic migration of due scheduled-set entries into their queues.
//!
//! Every node runs its own ticker per set — there is no leader election.
//! The deschedule script's atomic `ZREM` guarantees at-most-one migration
//! per entry even when several nodes tick at once.

use crate::clock::{Clock, Random};
use crate::error::KiqResult;
use crate::redis::RedisClient;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Ticks a single scheduled set (e.g. `schedule` or `retry`).
pub struct Scheduler {
    set_name: String,
    base_interval: std::time::Duration,
    redis: Arc<RedisClient>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn Random>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(
        set_name: impl Into<String>,
        base_interval: std::time::Duration,
        redis: Arc<RedisClient>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn Random>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            set_name: set_name.into(),
            base_interval,
            redis,
            clock,
            random,
            shutdown_tx,
        }
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Migrate every member of this set that is due right now. Exposed apart
    /// from [`run`](Self::run) so a single tick can be driven deterministically.
    pub async fn tick_once(&self) -> KiqResult<u64> {
        let now = self.clock.now_secs();
        let moved = self.redis.deschedule(&self.set_name, now).await?;
        if moved > 0 {
            debug!(set = %self.set_name, moved, "migrated due jobs");
        }
        Ok(moved)
    }

    /// Ticks on a jittered interval (±50% of `base_interval`) until
    /// [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(set = %self.set_name, interval_secs = self.base_interval.as_secs_f64(), "starting scheduler");

        loop {
            let sleep_for = self.jittered_interval();
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }

            if let Err(err) = self.tick_once().await {
                error!(set = %self.set_name, error = %err, "scheduler tick failed");
            }
        }

        info!(set = %self.set_name, "scheduler stopped");
    }

    fn jittered_interval(&self) -> std::time::Duration {
        let base_ms = self.base_interval.as_millis() as u64;
        let half = base_ms / 2;
        let offset = self.random.jitter(base_ms.max(1)) % (half.max(1) * 2 + 1);
        let jittered_ms = (base_ms.saturating_sub(half)).saturating_add(offset);
        std::time::Duration::from_millis(jittered_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, StepRandom};
    use crate::config::RedisConfig;
    use crate::redis::RedisClient;
    use deadpool_redis::{Config, Runtime};

    fn test_redis() -> Arc<RedisClient> {
        let config = RedisConfig::default();
        let pool = Config::from_url(&config.url)
            .builder()
            .unwrap()
            .runtime(Runtime::Tokio1)
            .build()
            .unwrap();
        Arc::new(RedisClient::new(pool))
    }

    #[test]
    fn jittered_interval_stays_within_plus_minus_fifty_percent() {
        let scheduler = Scheduler::new(
            "schedule",
            std::time::Duration::from_secs(10),
            test_redis(),
            Arc::new(FixedClock(0.0)),
            Arc::new(StepRandom::new("x", 3_000)),
        );
        let interval = scheduler.jittered_interval();
        assert!(interval.as_millis() >= 5_000);
        assert!(interval.as_millis() <= 15_000);
    }

    #[test]
    fn set_name_round_trips() {
        let scheduler = Scheduler::new(
            "retry",
            std::time::Duration::from_secs(1),
            test_redis(),
            Arc::new(FixedClock(0.0)),
            Arc::new(StepRandom::new("x", 0)),
        );
        assert_eq!(scheduler.set_name(), "retry");
    }
}
