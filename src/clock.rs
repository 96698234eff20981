//! Injectable time and randomness so job-id generation and backoff math can
//! be driven deterministically from tests.

use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over wall-clock time.
pub trait Clock: Send + Sync {
    /// Current Unix time in (possibly fractional) seconds.
    fn now_secs(&self) -> f64;

    /// Current Unix time in whole milliseconds.
    fn now_ms(&self) -> i64 {
        (self.now_secs() * 1000.0) as i64
    }
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// A clock fixed at a single instant, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub f64);

impl Clock for FixedClock {
    fn now_secs(&self) -> f64 {
        self.0
    }
}

/// Abstraction over randomness: job-id bytes and retry jitter.
pub trait Random: Send + Sync {
    /// A 24-character lowercase-hex job id from 12 random bytes.
    fn job_id(&self) -> String;

    /// A uniformly distributed value in `[0, range)`. `range == 0` yields `0`.
    fn jitter(&self, range: u64) -> u64;
}

/// Randomness backed by the OS CSPRNG (`rand::rngs::OsRng`).
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl Random for OsRandom {
    fn job_id(&self) -> String {
        let mut bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    fn jitter(&self, range: u64) -> u64 {
        if range == 0 {
            return 0;
        }
        rand::rngs::OsRng.next_u64() % range
    }
}

/// Deterministic randomness for tests: a fixed job id and a fixed jitter
/// value (clamped into whatever range is requested).
#[derive(Debug, Clone)]
pub struct StepRandom {
    pub id: String,
    pub jitter: u64,
}

impl StepRandom {
    pub fn new(id: impl Into<String>, jitter: u64) -> Self {
        Self {
            id: id.into(),
            jitter,
        }
    }
}

impl Random for StepRandom {
    fn job_id(&self) -> String {
        self.id.clone()
    }

    fn jitter(&self, range: u64) -> u64 {
        if range == 0 {
            0
        } else {
            self.jitter % range
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_reports_configured_time() {
        let clock = FixedClock(1000.0);
        assert_eq!(clock.now_secs(), 1000.0);
        assert_eq!(clock.now_ms(), 1_000_000);
    }

    #[test]
    fn os_random_job_id_is_24_hex_chars() {
        let id = OsRandom.job_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn os_random_job_ids_are_not_trivially_repeated() {
        assert_ne!(OsRandom.job_id(), OsRandom.job_id());
    }

    #[test]
    fn step_random_is_deterministic() {
        let r = StepRandom::new("a".repeat(24), 17);
        assert_eq!(r.job_id(), "a".repeat(24));
        assert_eq!(r.jitter(30), 17);
        assert_eq!(r.jitter(0), 0);
    }
}
