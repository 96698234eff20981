//! kiq - a distributed background job processing engine, wire-compatible
//! with an established Redis-backed job queue protocol.
//!
//! Producers enqueue JSON job envelopes into Redis through [`Kiq`]; worker
//! processes pull them with [`Supervisor`], execute them across a bounded
//! pool per queue, and report outcomes through a [`ReporterChain`] that
//! drives retries, unique-lock release, and backup-list pruning.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Redis (shared state)                       │
//! │  queue:<name>   queue:<name>:<node>   schedule   retry   unique:*  │
//! └───────────────▲───────────────────────────────▲───────────────────┘
//!                 │                                │
//!       ┌─────────┴─────────┐              ┌───────┴────────┐
//!       │    Kiq::enqueue    │              │   Schedulers    │
//!       │  (Embedding API)   │              │ (schedule/retry)│
//!       └────────────────────┘              └────────────────┘
//!                 ▲
//!                 │ produces jobs
//!       ┌─────────┴──────────────────────────────────────────┐
//!       │                     Supervisor                       │
//!       │   ┌───────────────┐   ┌───────────────┐             │
//!       │   │ QueuePipeline │   │ QueuePipeline │   ...       │
//!       │   │  producer +   │   │  producer +   │             │
//!       │   │  N executors  │   │  N executors  │             │
//!       │   └───────┬───────┘   └───────┬───────┘             │
//!       │           └──────────┬────────┘                     │
//!       │                      ▼                               │
//!       │               ReporterChain                          │
//!       │    (Retryer, Unlocker, BackupPruner, Logger, ...)    │
//!       └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kiq::{Kiq, KiqConfig, EnqueueOptions};
//! use serde_json::json;
//!
//! # async fn run() -> kiq::KiqResult<()> {
//! let config = KiqConfig::default();
//! let kiq = Kiq::connect(&config).await?;
//!
//! kiq.enqueue(json!({"class": "SendEmail", "args": ["user@example.com"]}), EnqueueOptions::none())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod embed;
pub mod error;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod redis;
pub mod reporter;
pub mod scheduler;
pub mod supervisor;
pub mod worker;

pub use clock::{Clock, FixedClock, OsRandom, Random, StepRandom, SystemClock};
pub use config::{KiqConfig, QueueConfig, RedisConfig};
pub use embed::{EnqueueOptions, Kiq};
pub use error::{KiqError, KiqResult};
pub use job::{Job, Retry, UniqueUntil, DEFAULT_RETRY_CAP};
pub use queue::{QueueHandle, QueuePipeline};
pub use redis::{RedisClient, RedisKeys};
pub use reporter::{standard_chain, BackupPruner, Event, Logger, Reporter, ReporterChain, Retryer, Unlocker};
pub use scheduler::Scheduler;
pub use supervisor::{Supervisor, SupervisorHandles};
pub use worker::{Worker, WorkerDescriptor, WorkerRegistry};

/// The pieces an embedding host most commonly needs: the Embedding API,
/// the worker contract, and configuration.
pub mod prelude {
    pub use crate::config::{KiqConfig, QueueConfig};
    pub use crate::embed::{EnqueueOptions, Kiq};
    pub use crate::error::{KiqError, KiqResult};
    pub use crate::job::Job;
    pub use crate::supervisor::Supervisor;
    pub use crate::worker::{Worker, WorkerDescriptor, WorkerRegistry};
}
