//! Contains definitions for the Redis keys, prefixes and counters that make up a queue's keyspace.
//!
//! All state for a queue lives under `{prefix:name}:<suffix>`. The braces are a literal
//! Redis cluster hash tag, so every key of a queue maps to the same slot and multi-key
//! scripts execute on a single shard.

/// Suffix for the list of runnable job IDs (FIFO, tail = LPUSH side, head = RPOP side).
pub const WAIT_SUFFIX: &str = "wait";

/// Suffix for the list holding runnable job IDs while the queue is paused. Same shape as `wait`.
pub const PAUSED_SUFFIX: &str = "paused";

/// Suffix for the list of job IDs currently leased by workers.
pub const ACTIVE_SUFFIX: &str = "active";

/// Suffix for the sorted set of delayed job IDs, scored by encoded fire time.
pub const DELAYED_SUFFIX: &str = "delayed";

/// Suffix for the sorted set mirroring prioritised IDs also present in `wait` (lower = more urgent).
pub const PRIORITY_SUFFIX: &str = "priority";

/// Suffix for the sorted set of completed job IDs, scored by completion time.
pub const COMPLETED_SUFFIX: &str = "completed";

/// Suffix for the sorted set of terminally failed job IDs, scored by failure time.
pub const FAILED_SUFFIX: &str = "failed";

/// Suffix for the sorted set of job IDs blocked on unmet child dependencies.
pub const WAITING_CHILDREN_SUFFIX: &str = "waiting-children";

/// Suffix for the set snapshotting `active` between stall checks.
pub const STALLED_SUFFIX: &str = "stalled";

/// Suffix for the timestamp guarding the stall check interval.
pub const STALLED_CHECK_SUFFIX: &str = "stalled-check";

/// Suffix for the default rate limiter token counter. Group buckets append `:{group}`.
pub const LIMITER_SUFFIX: &str = "limiter";

/// Suffix for the monotonic job ID counter.
pub const ID_SUFFIX: &str = "id";

/// Suffix for the capped event stream. The same key doubles as the pub/sub channel name.
pub const EVENTS_SUFFIX: &str = "events";

/// Suffix for the queue-level metadata hash (paused flag).
pub const META_SUFFIX: &str = "meta";

/// Suffix for the sorted set of repeat-job keys scored by next fire slot.
pub const REPEAT_SUFFIX: &str = "repeat";

/// Suffixes for the sliding completion/failure counters.
pub const METRICS_COMPLETED_SUFFIX: &str = "metrics:completed";
pub const METRICS_FAILED_SUFFIX: &str = "metrics:failed";

/// Canonical keys for a single queue's state in Redis.
///
/// Construct once per queue instance; all components (scripts, queue, worker, scheduler)
/// take their key names from here so the layout is defined in exactly one place.
#[derive(Clone, Debug)]
pub struct QueueKeys {
    /// Key prefix, e.g. `gantry`.
    pub prefix: String,

    /// Name of the queue.
    pub name: String,

    /// Hash-tagged base, `{prefix:name}`.
    base: String,

    pub wait: String,
    pub paused: String,
    pub active: String,
    pub delayed: String,
    pub priority: String,
    pub completed: String,
    pub failed: String,
    pub waiting_children: String,
    pub stalled: String,
    pub stalled_check: String,
    pub limiter: String,
    pub id: String,
    pub events: String,
    pub meta: String,
    pub repeat: String,
    pub metrics_completed: String,
    pub metrics_failed: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, name: &str) -> Self {
        let base = format!("{{{}:{}}}", prefix, name);
        let key = |suffix: &str| format!("{}:{}", base, suffix);
        Self {
            prefix: prefix.to_owned(),
            name: name.to_owned(),
            wait: key(WAIT_SUFFIX),
            paused: key(PAUSED_SUFFIX),
            active: key(ACTIVE_SUFFIX),
            delayed: key(DELAYED_SUFFIX),
            priority: key(PRIORITY_SUFFIX),
            completed: key(COMPLETED_SUFFIX),
            failed: key(FAILED_SUFFIX),
            waiting_children: key(WAITING_CHILDREN_SUFFIX),
            stalled: key(STALLED_SUFFIX),
            stalled_check: key(STALLED_CHECK_SUFFIX),
            limiter: key(LIMITER_SUFFIX),
            id: key(ID_SUFFIX),
            events: key(EVENTS_SUFFIX),
            meta: key(META_SUFFIX),
            repeat: key(REPEAT_SUFFIX),
            metrics_completed: key(METRICS_COMPLETED_SUFFIX),
            metrics_failed: key(METRICS_FAILED_SUFFIX),
            base,
        }
    }

    /// The hash-tagged base, `{prefix:name}`. Job keys hang directly off this.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Key of the hash holding a single job's fields.
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:{}", self.base, job_id)
    }

    /// Key of a job's worker-ownership lock.
    pub fn lock(&self, job_id: &str) -> String {
        format!("{}:{}:lock", self.base, job_id)
    }

    /// Key of a job's append-only log list.
    pub fn logs(&self, job_id: &str) -> String {
        format!("{}:{}:logs", self.base, job_id)
    }

    /// Key of the set recording a parent job's unresolved children.
    pub fn dependencies(&self, job_id: &str) -> String {
        format!("{}:{}:dependencies", self.base, job_id)
    }

    /// Key of the rate limiter bucket for a group value.
    pub fn limiter_group(&self, group: &str) -> String {
        format!("{}:{}", self.limiter, group)
    }

    /// Pattern matching every key in this queue's namespace. Used by obliterate.
    pub fn namespace_pattern(&self) -> String {
        format!("{}*", self.base)
    }

    /// Validate a queue name, allowed chars are: [a-zA-Z0-9_.-].
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    }
}
