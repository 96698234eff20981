//! Error types for the job engine.

use thiserror::Error;

/// Result type for job engine operations.
pub type KiqResult<T> = Result<T, KiqError>;

/// Errors raised anywhere in the job engine.
///
/// Decode, resolve, execution, timeout, and cancellation errors all funnel
/// into a `failure` event for the reporter chain; they are never fatal to a
/// queue pipeline. Transport errors on the hot path are not recovered
/// locally — the caller's task fails and the supervisor restarts it.
#[derive(Debug, Error)]
pub enum KiqError {
    /// Redis is unreachable or returned a protocol error.
    #[error("transport error: {0}")]
    Transport(#[from] redis::RedisError),

    /// Failed to check out a pooled Redis connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// A queue payload could not be parsed into a `Job`.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// `job.class` has no registered worker implementation.
    #[error("no worker registered for class {0:?}")]
    Resolve(String),

    /// A worker's `perform` returned an error.
    #[error("execution failed: {0}")]
    Execution(String),

    /// `perform` did not finish before its deadline.
    #[error("job timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The pipeline was cancelled (shutdown) while the job was running.
    #[error("execution cancelled")]
    Cancellation,

    /// Bad configuration supplied by the embedding host.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl KiqError {
    /// The error class name reported on the job envelope (`error_class`).
    pub fn class_name(&self) -> &'static str {
        match self {
            KiqError::Transport(_) => "TransportError",
            KiqError::Pool(_) => "PoolError",
            KiqError::Decode(_) => "DecodeError",
            KiqError::Resolve(_) => "UnknownWorker",
            KiqError::Execution(_) => "ExecutionError",
            KiqError::Timeout(_) => "Timeout",
            KiqError::Cancellation => "Cancelled",
            KiqError::Configuration(_) => "ConfigurationError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_names_are_stable() {
        assert_eq!(KiqError::Cancellation.class_name(), "Cancelled");
        assert_eq!(
            KiqError::Execution("boom".into()).class_name(),
            "ExecutionError"
        );
        assert_eq!(
            KiqError::Timeout(std::time::Duration::from_secs(1)).class_name(),
            "Timeout"
        );
    }
}
