//! The worker contract: a class identifier, execution behaviour, and the
//! defaults a job of that class should carry if the caller doesn't override
//! them. Resolution from `job.class` to an implementation is an explicit,
//! host-supplied registry — never reflection.

use crate::error::KiqError;
use crate::job::UniqueUntil;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Implemented by a job class. `perform` receives the job's `args` exactly
/// as they were enqueued.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn perform(&self, args: Value) -> Result<(), KiqError>;
}

/// Everything the engine needs to know about a job class beyond how to run
/// it: its retry cap, uniqueness defaults, and execution deadline.
#[derive(Clone)]
pub struct WorkerDescriptor {
    pub class: String,
    pub retry_cap: Option<u32>,
    pub unique_for: Option<Duration>,
    pub unique_until: Option<UniqueUntil>,
    pub timeout: Option<Duration>,
    pub worker: Arc<dyn Worker>,
}

impl WorkerDescriptor {
    pub fn new(class: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            class: class.into(),
            retry_cap: None,
            unique_for: None,
            unique_until: None,
            timeout: None,
            worker,
        }
    }

    pub fn retry_cap(mut self, cap: u32) -> Self {
        self.retry_cap = Some(cap);
        self
    }

    pub fn unique(mut self, for_: Duration, until: UniqueUntil) -> Self {
        self.unique_for = Some(for_);
        self.unique_until = Some(until);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Maps `job.class` strings to their descriptor. Built by the embedding
/// host and handed to the Supervisor at construction time.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    entries: HashMap<String, WorkerDescriptor>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: WorkerDescriptor) -> &mut Self {
        self.entries.insert(descriptor.class.clone(), descriptor);
        self
    }

    pub fn resolve(&self, class: &str) -> Option<&WorkerDescriptor> {
        self.entries.get(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopWorker;

    #[async_trait]
    impl Worker for NoopWorker {
        async fn perform(&self, _args: Value) -> Result<(), KiqError> {
            Ok(())
        }
    }

    #[test]
    fn registry_resolves_registered_classes() {
        let mut registry = WorkerRegistry::new();
        registry.register(
            WorkerDescriptor::new("SendEmail", Arc::new(NoopWorker))
                .retry_cap(5)
                .timeout(Duration::from_secs(30)),
        );

        let descriptor = registry.resolve("SendEmail").expect("registered class");
        assert_eq!(descriptor.retry_cap, Some(5));
        assert_eq!(descriptor.timeout, Some(Duration::from_secs(30)));
        assert!(registry.resolve("Unknown").is_none());
    }

    #[test]
    fn classes_lists_every_registered_name() {
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerDescriptor::new("A", Arc::new(NoopWorker)));
        registry.register(WorkerDescriptor::new("B", Arc::new(NoopWorker)));
        let mut names: Vec<&str> = registry.classes().collect();
        names.sort();
        assert_eq!(names, vec!["A", "B"]);
    }
}
