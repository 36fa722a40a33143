mod field;
mod options;
mod state;

pub use self::field::Field;
pub use self::options::{Backoff, JobOptions, Parent, RepeatOptions, Retention};
pub use self::state::{State, ALL_STATES};

use std::collections::HashMap;

use serde::Serialize;

use crate::models::{GantryError, GantryResult};

/// A unit of work with opaque payload and control metadata, materialized from its
/// Redis hash. The payload is carried as JSON; the core never inspects it beyond
/// the optional rate-limit group field.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Job {
    /// Unique within the queue. Grouped rate-limited jobs carry a `:{group}` suffix.
    pub id: String,

    /// Name given at enqueue time.
    pub name: String,

    /// Opaque payload.
    pub data: serde_json::Value,

    /// Options the job was enqueued with.
    pub opts: JobOptions,

    /// Last value reported through `updateProgress`.
    pub progress: serde_json::Value,

    /// Number of attempts that have run to a verdict.
    pub attempts_made: u32,

    /// Value returned by the processor on success.
    pub returnvalue: Option<serde_json::Value>,

    /// Reason recorded by the most recent failure.
    pub failed_reason: Option<String>,

    /// Bounded list of stacktrace lines, most recent first.
    pub stacktrace: Vec<String>,

    /// Creation time, ms since epoch.
    pub timestamp: u64,

    /// Initial delay in ms.
    pub delay: u64,

    /// When a worker last claimed the job, ms since epoch.
    pub processed_on: Option<u64>,

    /// When the job reached a terminal state, ms since epoch.
    pub finished_on: Option<u64>,

    /// Full Redis key of the parent job, when part of a flow.
    pub parent_key: Option<String>,

    /// Repeat-job key for jobs spawned by a repeat schedule.
    pub repeat_job_key: Option<String>,
}

impl Job {
    /// Build a job from the field/value pairs of its Redis hash.
    ///
    /// An empty map means the hash does not exist; that's surfaced as `NoSuchJob`
    /// since Redis cannot distinguish a missing key from an empty hash.
    pub fn from_hash(id: &str, map: HashMap<String, String>) -> GantryResult<Self> {
        if map.is_empty() {
            return Err(GantryError::NoSuchJob(id.to_owned()));
        }

        let opts: JobOptions = match map.get(Field::Opts.as_ref()) {
            Some(raw) => serde_json::from_str(raw)?,
            None => JobOptions::default(),
        };
        let data = match map.get(Field::Data.as_ref()) {
            Some(raw) => serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone())),
            None => serde_json::Value::Null,
        };
        let progress = match map.get(Field::Progress.as_ref()) {
            Some(raw) => serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone())),
            None => serde_json::Value::from(0),
        };
        let stacktrace = match map.get(Field::Stacktrace.as_ref()) {
            Some(raw) => serde_json::from_str(raw).unwrap_or_default(),
            None => Vec::new(),
        };

        let parse_u64 = |field: Field| -> Option<u64> {
            map.get(field.as_ref()).and_then(|v| v.parse().ok())
        };

        Ok(Self {
            id: id.to_owned(),
            name: map.get(Field::Name.as_ref()).cloned().unwrap_or_default(),
            data,
            opts,
            progress,
            attempts_made: parse_u64(Field::AttemptsMade).unwrap_or(0) as u32,
            returnvalue: map
                .get(Field::Returnvalue.as_ref())
                .and_then(|raw| serde_json::from_str(raw).ok()),
            failed_reason: map.get(Field::FailedReason.as_ref()).cloned(),
            stacktrace,
            timestamp: parse_u64(Field::Timestamp).unwrap_or(0),
            delay: parse_u64(Field::Delay).unwrap_or(0),
            processed_on: parse_u64(Field::ProcessedOn),
            finished_on: parse_u64(Field::FinishedOn),
            parent_key: map.get(Field::ParentKey.as_ref()).cloned(),
            repeat_job_key: map.get(Field::RepeatJobKey.as_ref()).cloned(),
        })
    }

    /// Attempts remaining after `attempts_made`, given the configured maximum.
    pub fn attempts_left(&self) -> u32 {
        self.opts.max_attempts().saturating_sub(self.attempts_made)
    }

    /// Delay before the next retry, or `None` when attempts are exhausted.
    /// `attempts_made` must already include the attempt that just failed.
    pub fn retry_delay(&self, attempts_made: u32) -> Option<u64> {
        if attempts_made >= self.opts.max_attempts() {
            return None;
        }
        Some(
            self.opts
                .backoff
                .map(|b| b.delay_for(attempts_made))
                .unwrap_or(0),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_hash() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("name".to_owned(), "send-mail".to_owned());
        map.insert("data".to_owned(), r#"{"to":"x@example.com"}"#.to_owned());
        map.insert(
            "opts".to_owned(),
            r#"{"attempts":3,"backoff":{"type":"fixed","delay":100}}"#.to_owned(),
        );
        map.insert("timestamp".to_owned(), "1700000000000".to_owned());
        map.insert("delay".to_owned(), "0".to_owned());
        map.insert("attemptsMade".to_owned(), "1".to_owned());
        map
    }

    #[test]
    fn from_hash_round_trip() {
        let job = Job::from_hash("42", sample_hash()).unwrap();
        assert_eq!(job.id, "42");
        assert_eq!(job.name, "send-mail");
        assert_eq!(job.data["to"], "x@example.com");
        assert_eq!(job.opts.max_attempts(), 3);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.timestamp, 1_700_000_000_000);
        assert!(job.parent_key.is_none());
    }

    #[test]
    fn missing_hash_is_no_such_job() {
        match Job::from_hash("9", HashMap::new()) {
            Err(GantryError::NoSuchJob(id)) => assert_eq!(id, "9"),
            other => panic!("expected NoSuchJob, got {:?}", other),
        }
    }

    #[test]
    fn retry_delay_respects_attempts() {
        let job = Job::from_hash("42", sample_hash()).unwrap();
        assert_eq!(job.retry_delay(1), Some(100));
        assert_eq!(job.retry_delay(2), Some(100));
        assert_eq!(job.retry_delay(3), None);
    }
}
