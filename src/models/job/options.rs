//! Job option records and their validation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{GantryError, GantryResult};

/// Options supplied when enqueuing a job. Serialized as JSON into the job hash's
/// `opts` field, so workers and scripts observe the same configuration the
/// producer validated.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOptions {
    /// Priority of the job, 1 is most urgent. Absent means no priority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    /// Milliseconds to wait before the job becomes runnable.
    pub delay: u64,

    /// Total number of attempts before the job is terminally failed. Defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Backoff policy applied between retry attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,

    /// Override for the generated job ID. Makes the add operation idempotent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// What to do with the job record once it completes successfully.
    pub remove_on_complete: Retention,

    /// What to do with the job record once it fails terminally.
    pub remove_on_fail: Retention,

    /// Parent job this job resolves a dependency of.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Parent>,

    /// Repeat schedule. Mutually exclusive with an explicit `job_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,

    /// Insert at the head of the queue instead of the tail.
    pub lifo: bool,

    /// Creation timestamp override, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,

    /// Maximum number of stacktrace lines retained on the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace_limit: Option<usize>,

    /// When this job fails terminally, discard the parent's dependency on it
    /// instead of failing the parent.
    pub ignore_dependency_on_failure: bool,
}

impl JobOptions {
    /// Check option ranges. Called on every enqueue before anything touches Redis.
    pub fn validate(&self) -> GantryResult<()> {
        if let Some(priority) = self.priority {
            if priority < 1 {
                return Err(GantryError::invalid("priority must be >= 1"));
            }
        }
        if let Some(attempts) = self.attempts {
            if attempts < 1 {
                return Err(GantryError::invalid("attempts must be >= 1"));
            }
        }
        if let Some(repeat) = &self.repeat {
            if repeat.every == 0 {
                return Err(GantryError::invalid("repeat.every must be >= 1ms"));
            }
            if self.job_id.is_some() {
                return Err(GantryError::invalid(
                    "jobId override cannot be combined with a repeat schedule",
                ));
            }
        }
        Ok(())
    }

    /// Total attempts allowed, defaulting to a single attempt.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.unwrap_or(1)
    }
}

/// Backoff policy between retry attempts of a failing job.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Constant delay between attempts.
    Fixed { delay: u64 },

    /// `delay * 2^(attempts_made - 1)` milliseconds.
    Exponential { delay: u64 },
}

impl Backoff {
    /// Delay in ms before retry number `attempts_made` (1-based: the first retry
    /// follows the first failed attempt).
    pub fn delay_for(&self, attempts_made: u32) -> u64 {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { delay } => {
                let shift = attempts_made.saturating_sub(1).min(63);
                delay.saturating_mul(1u64 << shift)
            }
        }
    }
}

/// Retention policy for finished job records.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Retention {
    /// `true` removes the record immediately, `false` keeps it forever.
    Remove(bool),

    /// Keep at most this many records, oldest trimmed first.
    Count(u64),

    /// Keep records subject to a count and/or a maximum age in seconds.
    Policy {
        #[serde(skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        age: Option<u64>,
    },
}

impl Default for Retention {
    fn default() -> Self {
        Retention::Remove(false)
    }
}

impl Retention {
    /// Whether the record is deleted as part of the finishing transition.
    pub fn removes_immediately(&self) -> bool {
        matches!(self, Retention::Remove(true))
    }

    /// Maximum number of records to keep, if bounded.
    pub fn keep_count(&self) -> Option<u64> {
        match self {
            Retention::Count(count) => Some(*count),
            Retention::Policy { count, .. } => *count,
            Retention::Remove(_) => None,
        }
    }

    /// Maximum age of kept records in milliseconds, if bounded.
    pub fn max_age_ms(&self) -> Option<u64> {
        match self {
            Retention::Policy { age: Some(age), .. } => Some(age * 1000),
            _ => None,
        }
    }
}

/// Reference to the parent job of a dependency edge. The parent lives in the
/// same queue; flows are single-queue so dependency resolution stays on one shard.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Parent {
    pub id: String,
}

/// Interval repeat schedule. Each occurrence is enqueued as a delayed job with a
/// deterministic ID derived from [`RepeatOptions::repeat_key`] and the fire slot.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepeatOptions {
    /// Interval between occurrences in ms.
    pub every: u64,

    /// Stop after this many occurrences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Timezone label. Only participates in the schedule hash; interval schedules
    /// fire on absolute time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,

    /// Occurrences spawned so far. Maintained internally.
    pub count: u32,
}

impl Default for RepeatOptions {
    fn default() -> Self {
        Self {
            every: 0,
            limit: None,
            tz: None,
            count: 0,
        }
    }
}

impl RepeatOptions {
    /// Deterministic key for this schedule: sha256 of `name:every:tz`. Two producers
    /// registering the same schedule collapse onto one entry in the `repeat` set.
    pub fn repeat_key(&self, name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(self.every.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(self.tz.as_deref().unwrap_or("").as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(32);
        for byte in digest.iter().take(16) {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// Next fire slot at or after `now`, aligned to the interval so instance IDs
    /// are deterministic across producers.
    pub fn next_slot(&self, now: u64) -> u64 {
        (now / self.every) * self.every + self.every
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validation() {
        assert!(JobOptions::default().validate().is_ok());

        let opts = JobOptions {
            priority: Some(0),
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = JobOptions {
            attempts: Some(0),
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = JobOptions {
            priority: Some(1),
            attempts: Some(3),
            delay: 500,
            ..Default::default()
        };
        assert!(opts.validate().is_ok());

        let opts = JobOptions {
            repeat: Some(RepeatOptions {
                every: 1000,
                ..Default::default()
            }),
            job_id: Some("custom".to_owned()),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn backoff_delays() {
        let fixed = Backoff::Fixed { delay: 250 };
        assert_eq!(fixed.delay_for(1), 250);
        assert_eq!(fixed.delay_for(5), 250);

        let exp = Backoff::Exponential { delay: 100 };
        assert_eq!(exp.delay_for(1), 100);
        assert_eq!(exp.delay_for(2), 200);
        assert_eq!(exp.delay_for(3), 400);
        assert_eq!(exp.delay_for(4), 800);
    }

    #[test]
    fn backoff_serialisation() {
        let opts = JobOptions {
            backoff: Some(Backoff::Exponential { delay: 100 }),
            ..Default::default()
        };
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["backoff"]["type"], "exponential");
        assert_eq!(json["backoff"]["delay"], 100);

        let parsed: JobOptions = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.backoff, Some(Backoff::Exponential { delay: 100 }));
    }

    #[test]
    fn retention_forms() {
        let keep: Retention = serde_json::from_str("false").unwrap();
        assert!(!keep.removes_immediately());
        assert_eq!(keep.keep_count(), None);

        let remove: Retention = serde_json::from_str("true").unwrap();
        assert!(remove.removes_immediately());

        let count: Retention = serde_json::from_str("100").unwrap();
        assert_eq!(count.keep_count(), Some(100));

        let policy: Retention = serde_json::from_str(r#"{"count": 5, "age": 60}"#).unwrap();
        assert_eq!(policy.keep_count(), Some(5));
        assert_eq!(policy.max_age_ms(), Some(60_000));
    }

    #[test]
    fn repeat_key_deterministic() {
        let a = RepeatOptions {
            every: 5000,
            tz: Some("UTC".to_owned()),
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a.repeat_key("sync"), b.repeat_key("sync"));
        assert_ne!(a.repeat_key("sync"), a.repeat_key("other"));

        let c = RepeatOptions {
            every: 6000,
            tz: Some("UTC".to_owned()),
            ..Default::default()
        };
        assert_ne!(a.repeat_key("sync"), c.repeat_key("sync"));
    }

    #[test]
    fn repeat_slots_align() {
        let repeat = RepeatOptions {
            every: 1000,
            ..Default::default()
        };
        assert_eq!(repeat.next_slot(1_000), 2_000);
        assert_eq!(repeat.next_slot(1_001), 2_000);
        assert_eq!(repeat.next_slot(1_999), 2_000);
        assert_eq!(repeat.next_slot(2_000), 3_000);
    }
}
