//! Metrics for job queue monitoring, registered through the `metrics`
//! facade so the embedding host can wire whichever exporter it prefers.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names emitted by this crate.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "kiq_jobs_enqueued_total";
    pub const JOBS_DEQUEUED_TOTAL: &str = "kiq_jobs_dequeued_total";
    pub const JOBS_SUCCEEDED_TOTAL: &str = "kiq_jobs_succeeded_total";
    pub const JOBS_FAILED_TOTAL: &str = "kiq_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "kiq_jobs_retried_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "kiq_jobs_dead_lettered_total";
    pub const JOBS_ACKNOWLEDGED_TOTAL: &str = "kiq_jobs_acknowledged_total";
    pub const JOB_DURATION_SECONDS: &str = "kiq_job_duration_seconds";
    pub const QUEUE_PENDING: &str = "kiq_queue_pending";
    pub const QUEUE_IN_FLIGHT: &str = "kiq_queue_in_flight";
}

/// Register metric descriptions with the active `metrics` recorder.
pub fn register() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(names::JOBS_DEQUEUED_TOTAL, "Total number of jobs dequeued");
    describe_counter!(names::JOBS_SUCCEEDED_TOTAL, "Total number of jobs completed successfully");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of job executions that failed");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of jobs re-queued for retry");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs dropped after exhausting retries"
    );
    describe_counter!(names::JOBS_ACKNOWLEDGED_TOTAL, "Total number of backup-list acknowledgements");
    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
    describe_gauge!(names::QUEUE_PENDING, "Current length of a queue's main list");
    describe_gauge!(names::QUEUE_IN_FLIGHT, "Current length of a queue's backup list for this node");
}

pub fn record_enqueued(queue: &str, class: &str) {
    counter!(
        names::JOBS_ENQUEUED_TOTAL,
        "queue" => queue.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

pub fn record_dequeued(queue: &str) {
    counter!(names::JOBS_DEQUEUED_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub fn record_success(queue: &str, class: &str, duration: Duration) {
    counter!(
        names::JOBS_SUCCEEDED_TOTAL,
        "queue" => queue.to_string(),
        "class" => class.to_string()
    )
    .increment(1);

    histogram!(
        names::JOB_DURATION_SECONDS,
        "queue" => queue.to_string(),
        "class" => class.to_string(),
        "outcome" => "success"
    )
    .record(duration.as_secs_f64());
}

pub fn record_failure(queue: &str, class: &str, error_class: &str, duration: Duration) {
    counter!(
        names::JOBS_FAILED_TOTAL,
        "queue" => queue.to_string(),
        "class" => class.to_string(),
        "error_class" => error_class.to_string()
    )
    .increment(1);

    histogram!(
        names::JOB_DURATION_SECONDS,
        "queue" => queue.to_string(),
        "class" => class.to_string(),
        "outcome" => "failure"
    )
    .record(duration.as_secs_f64());
}

pub fn record_retried(queue: &str, class: &str) {
    counter!(
        names::JOBS_RETRIED_TOTAL,
        "queue" => queue.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

pub fn record_dead_lettered(queue: &str, class: &str) {
    counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "queue" => queue.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

pub fn record_acknowledged(queue: &str, class: &str) {
    counter!(
        names::JOBS_ACKNOWLEDGED_TOTAL,
        "queue" => queue.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

pub fn update_queue_gauges(queue: &str, pending: u64, in_flight: u64) {
    gauge!(names::QUEUE_PENDING, "queue" => queue.to_string()).set(pending as f64);
    gauge!(names::QUEUE_IN_FLIGHT, "queue" => queue.to_string()).set(in_flight as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_does_not_panic_without_an_installed_recorder() {
        register();
        record_enqueued("default", "Worker");
        record_dequeued("default");
        record_success("default", "Worker", Duration::from_millis(5));
        record_failure("default", "Worker", "Timeout", Duration::from_millis(5));
        record_retried("default", "Worker");
        record_dead_lettered("default", "Worker");
        record_acknowledged("default", "Worker");
        update_queue_gauges("default", 3, 1);
    }
}
