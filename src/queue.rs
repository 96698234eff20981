//! The queue pipeline: per queue, a demand-driven producer and a
//! semaphore-bounded pool of executors, maintaining the per-node backup set.

use crate::config::QueueConfig;
use crate::error::KiqError;
use crate::job::Job;
use crate::metrics;
use crate::redis::RedisClient;
use crate::reporter::{Event, ReporterChain};
use crate::worker::WorkerRegistry;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A read-only view onto a running pipeline's in-flight count, for the
/// metrics component to poll queue depth against.
#[derive(Clone)]
pub struct QueueHandle {
    name: String,
    in_flight: Arc<AtomicUsize>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// One pipeline per configured queue: a producer that tracks outstanding
/// executor demand, and the executors themselves.
pub struct QueuePipeline {
    name: String,
    concurrency: usize,
    node_id: String,
    grace: Duration,
    redis: Arc<RedisClient>,
    registry: Arc<WorkerRegistry>,
    reporters: Arc<ReporterChain>,
    in_flight: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    cancel_tx: watch::Sender<bool>,
}

impl QueuePipeline {
    pub fn new(
        config: &QueueConfig,
        node_id: String,
        grace: Duration,
        redis: Arc<RedisClient>,
        registry: Arc<WorkerRegistry>,
        reporters: Arc<ReporterChain>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            name: config.name.clone(),
            concurrency: config.concurrency.max(1),
            node_id,
            grace,
            redis,
            registry,
            reporters,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            cancel_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            name: self.name.clone(),
            in_flight: self.in_flight.clone(),
        }
    }

    /// Stop pulling new work. Does not by itself wait for in-flight jobs —
    /// that happens inside [`run`](Self::run).
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Polls the main list length and updates both queue gauges. Logged and
    /// skipped on error rather than interrupting the pipeline loop.
    async fn update_gauges(&self) {
        match self.redis.queue_len(&self.name).await {
            Ok(pending) => {
                metrics::update_queue_gauges(&self.name, pending, self.in_flight.load(Ordering::Relaxed) as u64);
            }
            Err(err) => {
                warn!(queue = %self.name, error = %err, "failed to poll queue length for gauges");
            }
        }
    }

    /// Runs the producer loop until [`stop`] is called, then drains
    /// in-flight executors up to the configured grace period before
    /// signalling cancellation to whatever is still running.
    pub async fn run(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut executors: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let demand = semaphore.available_permits();
            if demand == 0 {
                self.update_gauges().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
                executors.retain(|handle| !handle.is_finished());
                continue;
            }

            let dequeued = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = self.redis.dequeue(&self.name, demand, &self.node_id) => result,
            };

            let payloads = match dequeued {
                Ok(payloads) => payloads,
                Err(err) => {
                    error!(queue = %self.name, error = %err, "dequeue failed");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            if payloads.is_empty() {
                self.update_gauges().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                continue;
            }

            metrics::record_dequeued(&self.name);

            for payload in payloads {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("pipeline semaphore is never closed");
                let pipeline = self.clone();
                let cancel_rx = self.cancel_tx.subscribe();
                executors.push(tokio::spawn(async move {
                    pipeline.execute(payload, cancel_rx).await;
                    drop(permit);
                }));
            }

            executors.retain(|handle| !handle.is_finished());
        }

        let drain = async {
            for handle in executors.drain(..) {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!(
                queue = %self.name,
                "shutdown grace period elapsed with jobs still in flight; signalling cancellation"
            );
            let _ = self.cancel_tx.send(true);
        }
    }

    async fn execute(&self, raw: String, mut cancel_rx: watch::Receiver<bool>) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        let job = match Job::decode(&raw) {
            Ok(job) => job,
            Err(err) => {
                let error_message = err.to_string();
                warn!(queue = %self.name, error = %error_message, "dropping undecodable payload");
                self.reporters
                    .dispatch(Event::DecodeFailure {
                        queue: self.name.clone(),
                        raw: raw.clone(),
                        node_id: self.node_id.clone(),
                        error_class: "DecodeError".to_string(),
                        error_message,
                    })
                    .await;
                if let Err(ack_err) = self.redis.acknowledge(&self.name, &self.node_id, &raw).await {
                    error!(queue = %self.name, error = %ack_err, "failed to acknowledge undecodable payload");
                }
                metrics::record_failure(&self.name, "unknown", "DecodeError", Duration::ZERO);
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        };

        self.reporters
            .dispatch(Event::Started {
                job: job.clone(),
                raw: raw.clone(),
                node_id: self.node_id.clone(),
            })
            .await;

        let Some(descriptor) = self.registry.resolve(&job.class).cloned() else {
            self.reporters
                .dispatch(Event::Failure {
                    job: job.clone(),
                    raw,
                    node_id: self.node_id.clone(),
                    error_class: job.class.clone(),
                    error_message: format!("no worker registered for class {:?}", job.class),
                })
                .await;
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            return;
        };

        let started = Instant::now();
        let args = job.args.clone();
        let run = run_with_deadline(descriptor.worker.perform(args), descriptor.timeout);

        let outcome = tokio::select! {
            result = run => result,
            _ = cancel_rx.changed() => Err(KiqError::Cancellation),
        };

        let duration = started.elapsed();

        match outcome {
            Ok(()) => {
                metrics::record_success(&self.name, &job.class, duration);
                self.reporters
                    .dispatch(Event::Success {
                        job,
                        raw,
                        node_id: self.node_id.clone(),
                    })
                    .await;
            }
            Err(err) => {
                let error_class = err.class_name().to_string();
                let error_message = err.to_string();
                metrics::record_failure(&self.name, &job.class, &error_class, duration);
                self.reporters
                    .dispatch(Event::Failure {
                        job,
                        raw,
                        node_id: self.node_id.clone(),
                        error_class,
                        error_message,
                    })
                    .await;
            }
        }

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn run_with_deadline(
    fut: impl Future<Output = Result<(), KiqError>>,
    deadline: Option<Duration>,
) -> Result<(), KiqError> {
    match deadline {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(result) => result,
            Err(_) => Err(KiqError::Timeout(d)),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_handle_reports_in_flight_count() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = QueueHandle {
            name: "default".to_string(),
            in_flight: counter.clone(),
        };
        counter.fetch_add(2, Ordering::Relaxed);
        assert_eq!(handle.in_flight(), 2);
        assert_eq!(handle.name(), "default");
    }

    #[tokio::test]
    async fn run_with_deadline_times_out() {
        let result = run_with_deadline(
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            },
            Some(Duration::from_millis(1)),
        )
        .await;
        assert!(matches!(result, Err(KiqError::Timeout(_))));
    }

    #[tokio::test]
    async fn run_with_deadline_passes_through_without_one() {
        let result = run_with_deadline(async { Ok(()) }, None).await;
        assert!(result.is_ok());
    }
}
