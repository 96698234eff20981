//! The canonical in-memory job representation, its wire encoding, and
//! uniqueness-token derivation.

use crate::clock::{Clock, Random};
use crate::error::{KiqError, KiqResult};
use crate::worker::WorkerDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use std::fmt;

/// Default cap on retries when `retry` is the boolean `true`.
pub const DEFAULT_RETRY_CAP: u32 = 25;

/// `job.retry` is either a boolean flag or an explicit integer cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Retry {
    Flag(bool),
    Cap(u32),
}

impl Default for Retry {
    fn default() -> Self {
        Retry::Flag(true)
    }
}

impl Retry {
    /// The effective retry cap. `false` never retries; `true` uses
    /// [`DEFAULT_RETRY_CAP`]; an integer is the cap itself.
    pub fn cap(&self) -> Option<u32> {
        match self {
            Retry::Flag(false) => None,
            Retry::Flag(true) => Some(DEFAULT_RETRY_CAP),
            Retry::Cap(n) => Some(*n),
        }
    }
}

/// `unique_until` is restricted to this closed set; any other wire value is
/// normalised to absent at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqueUntil {
    Start,
    Success,
}

fn parse_unique_until(s: &str) -> Option<UniqueUntil> {
    match s {
        "start" => Some(UniqueUntil::Start),
        "success" => Some(UniqueUntil::Success),
        _ => None,
    }
}

fn default_queue() -> String {
    "default".to_string()
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// The canonical job envelope, field names matching the reference system's
/// wire format exactly (see the data model in the design docs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    #[serde(alias = "module")]
    pub class: String,
    pub args: Value,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<f64>,
    pub created_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_for: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_until: Option<UniqueUntil>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlocks_at: Option<i64>,
}

impl Job {
    /// Build a job from a loosely-typed map, as the Embedding API receives
    /// it. Normalises the `module` alias for `class`, fills `jid` and
    /// `created_at` when absent, coerces `unique_until`, and derives the
    /// uniqueness token when `unique_for` is present.
    pub fn from_map(
        mut map: Map<String, Value>,
        clock: &dyn Clock,
        random: &dyn Random,
    ) -> KiqResult<Self> {
        if !map.contains_key("class") {
            if let Some(module) = map.remove("module") {
                map.insert("class".to_string(), module);
            }
        }

        let class = map
            .get("class")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| KiqError::Configuration("job is missing `class`".into()))?;
        if class.is_empty() {
            return Err(KiqError::Configuration("`class` must not be empty".into()));
        }

        let args = map.remove("args").unwrap_or_else(|| Value::Array(Vec::new()));
        if !(args.is_array() || args.is_object()) {
            return Err(KiqError::Configuration(
                "`args` must be a JSON array or object".into(),
            ));
        }

        let queue = map
            .get("queue")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        let retry = map
            .get("retry")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let retry_count = map.get("retry_count").and_then(Value::as_u64).unwrap_or(0) as u32;
        let at = map.get("at").and_then(Value::as_f64);
        let created_at = map
            .get("created_at")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| clock.now_secs());
        let enqueued_at = map.get("enqueued_at").and_then(Value::as_f64);
        let failed_at = map.get("failed_at").and_then(Value::as_f64);
        let retried_at = map.get("retried_at").and_then(Value::as_f64);
        let error_class = map.get("error_class").and_then(Value::as_str).map(String::from);
        let error_message = map.get("error_message").and_then(Value::as_str).map(String::from);
        let unique_for = map.get("unique_for").and_then(Value::as_u64);
        let unique_until = map
            .get("unique_until")
            .and_then(Value::as_str)
            .and_then(parse_unique_until);

        let jid = map
            .get("jid")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| random.job_id());

        let mut job = Job {
            jid,
            class,
            args,
            queue,
            retry,
            retry_count,
            at,
            created_at,
            enqueued_at,
            failed_at,
            retried_at,
            error_class,
            error_message,
            unique_for,
            unique_until,
            unique_token: None,
            unlocks_at: None,
        };

        if job.unique_for.is_some() {
            job.unique_token = Some(job.compute_unique_token());
        }

        Ok(job)
    }

    /// Build a job from a map exactly as [`from_map`](Self::from_map) does,
    /// but first filling `retry`/`unique_for`/`unique_until` from a worker's
    /// declared defaults for any of those the caller's map didn't already
    /// set. An explicit value in the map always wins over the class's
    /// declared default.
    pub fn from_map_with_defaults(
        mut map: Map<String, Value>,
        clock: &dyn Clock,
        random: &dyn Random,
        descriptor: Option<&WorkerDescriptor>,
    ) -> KiqResult<Self> {
        if let Some(descriptor) = descriptor {
            if !map.contains_key("retry") {
                if let Some(cap) = descriptor.retry_cap {
                    map.insert("retry".to_string(), Value::from(cap));
                }
            }

            if !map.contains_key("unique_for") {
                if let Some(unique_for) = descriptor.unique_for {
                    map.insert("unique_for".to_string(), Value::from(unique_for.as_millis() as u64));
                }
            }

            if !map.contains_key("unique_until") {
                if let Some(unique_until) = descriptor.unique_until {
                    let value = match unique_until {
                        UniqueUntil::Start => "start",
                        UniqueUntil::Success => "success",
                    };
                    map.insert("unique_until".to_string(), Value::from(value));
                }
            }
        }

        Self::from_map(map, clock, random)
    }

    /// Build a job from an already-complete JSON value (a queue payload).
    pub fn from_value(value: Value) -> KiqResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Serialise to a `serde_json::Value`, applying the same absent-value
    /// and `retry_count == 0` stripping rules as [`Job::encode`].
    pub fn to_value(&self) -> KiqResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a job from its Redis-list payload.
    pub fn decode(payload: &str) -> KiqResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Encode to the wire JSON string, stripping absent fields and omitting
    /// `retry_count` when zero.
    pub fn encode(&self) -> KiqResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deterministic SHA1 over a canonical textual form of `(class, queue,
    /// args)`. Stable across process runs; not expected to match the
    /// reference system's own token derivation (see design notes).
    pub fn compute_unique_token(&self) -> String {
        let canonical = format!(
            "{}\u{0}{}\u{0}{}",
            self.class,
            self.queue,
            canonical_json(&self.args)
        );
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether this job still holds a unique lock eligible for release.
    pub fn holds_unique_lock(&self) -> bool {
        self.unique_for.is_some() && self.unique_token.is_some()
    }
}

/// A stable textual form of a JSON value: object keys sorted, no
/// whitespace. Used as the hash input for uniqueness tokens so that
/// tokens are reproducible across processes and serde_json versions
/// regardless of the `preserve_order` feature.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{}]", body)
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job(jid={}, class={}, queue={})", self.jid, self.class, self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, StepRandom};
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn from_map_fills_jid_and_created_at() {
        let clock = FixedClock(1000.0);
        let random = StepRandom::new("a".repeat(24), 0);
        let job = Job::from_map(map(json!({"class": "W", "args": [1, 2]})), &clock, &random).unwrap();

        assert_eq!(job.jid, "a".repeat(24));
        assert_eq!(job.created_at, 1000.0);
        assert_eq!(job.queue, "default");
        assert_eq!(job.retry, Retry::Flag(true));
        assert_eq!(job.retry_count, 0);
    }

    struct NoopWorker;

    #[async_trait::async_trait]
    impl crate::worker::Worker for NoopWorker {
        async fn perform(&self, _args: Value) -> KiqResult<()> {
            Ok(())
        }
    }

    #[test]
    fn from_map_with_defaults_applies_descriptor_retry_cap_and_unique_settings() {
        let clock = FixedClock(1000.0);
        let random = StepRandom::new("c".repeat(24), 0);
        let descriptor = crate::worker::WorkerDescriptor::new("W", std::sync::Arc::new(NoopWorker))
            .retry_cap(5)
            .unique(std::time::Duration::from_secs(60), UniqueUntil::Success);

        let job = Job::from_map_with_defaults(
            map(json!({"class": "W", "args": [1]})),
            &clock,
            &random,
            Some(&descriptor),
        )
        .unwrap();

        assert_eq!(job.retry, Retry::Cap(5));
        assert_eq!(job.unique_for, Some(60_000));
        assert_eq!(job.unique_until, Some(UniqueUntil::Success));
        assert!(job.unique_token.is_some());
    }

    #[test]
    fn from_map_with_defaults_does_not_override_an_explicit_retry_value() {
        let clock = FixedClock(1000.0);
        let random = StepRandom::new("d".repeat(24), 0);
        let descriptor =
            crate::worker::WorkerDescriptor::new("W", std::sync::Arc::new(NoopWorker)).retry_cap(5);

        let job = Job::from_map_with_defaults(
            map(json!({"class": "W", "args": [], "retry": false})),
            &clock,
            &random,
            Some(&descriptor),
        )
        .unwrap();

        assert_eq!(job.retry, Retry::Flag(false));
    }

    #[test]
    fn from_map_accepts_module_alias() {
        let clock = FixedClock(0.0);
        let random = StepRandom::new("b".repeat(24), 0);
        let job = Job::from_map(map(json!({"module": "W", "args": []})), &clock, &random).unwrap();
        assert_eq!(job.class, "W");
    }

    #[test]
    fn from_map_rejects_non_container_args() {
        let clock = FixedClock(0.0);
        let random = StepRandom::new("c".repeat(24), 0);
        let err = Job::from_map(map(json!({"class": "W", "args": "oops"})), &clock, &random);
        assert!(err.is_err());
    }

    #[test]
    fn from_map_normalises_invalid_unique_until_to_absent() {
        let clock = FixedClock(0.0);
        let random = StepRandom::new("d".repeat(24), 0);
        let job = Job::from_map(
            map(json!({"class": "W", "args": [], "unique_until": "never"})),
            &clock,
            &random,
        )
        .unwrap();
        assert_eq!(job.unique_until, None);
    }

    #[test]
    fn encode_omits_zero_retry_count_and_absent_fields() {
        let clock = FixedClock(1000.0);
        let random = StepRandom::new("e".repeat(24), 0);
        let job = Job::from_map(map(json!({"class": "W", "args": []})), &clock, &random).unwrap();
        let encoded = job.encode().unwrap();
        assert!(!encoded.contains("retry_count"));
        assert!(!encoded.contains("unique_for"));
        assert!(!encoded.contains("error_class"));
    }

    #[test]
    fn decode_encode_round_trips_modulo_absent_stripping() {
        let clock = FixedClock(1000.0);
        let random = StepRandom::new("f".repeat(24), 0);
        let job = Job::from_map(map(json!({"class": "W", "args": [1]})), &clock, &random).unwrap();
        let encoded = job.encode().unwrap();
        let decoded = Job::decode(&encoded).unwrap();
        assert_eq!(job, decoded);
    }

    #[test]
    fn unique_token_is_deterministic_across_instances() {
        let clock = FixedClock(0.0);
        let r1 = StepRandom::new("1".repeat(24), 0);
        let r2 = StepRandom::new("2".repeat(24), 0);
        let job1 = Job::from_map(map(json!({"class": "W", "queue": "q", "args": {"a": 1, "b": 2}})), &clock, &r1).unwrap();
        let job2 = Job::from_map(map(json!({"class": "W", "queue": "q", "args": {"b": 2, "a": 1}})), &clock, &r2).unwrap();
        assert_eq!(job1.compute_unique_token(), job2.compute_unique_token());
    }

    #[test]
    fn retry_cap_resolution() {
        assert_eq!(Retry::Flag(true).cap(), Some(DEFAULT_RETRY_CAP));
        assert_eq!(Retry::Flag(false).cap(), None);
        assert_eq!(Retry::Cap(5).cap(), Some(5));
    }
}
