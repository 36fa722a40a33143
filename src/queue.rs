//! Defines the producer and management interface to a queue in Redis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Deserialize;

use crate::config::Config;
use crate::keys::QueueKeys;
use crate::models::{GantryError, GantryResult, Job, JobCounts, JobOptions, State};
use crate::redis_utils::{connect, now_ms};
use crate::scripts::{AddJobArgs, Scripts};

/// Rate limiter configuration: at most `max` fetches per `duration` ms, optionally
/// bucketed by a field of the job payload.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimiterOptions {
    /// Tokens per window.
    pub max: u32,

    /// Window length in ms.
    pub duration: u64,

    /// Payload field whose value scopes the bucket. Jobs whose payload lacks the
    /// field share the default bucket and are not group-limited.
    pub group_key: Option<String>,

    /// When over quota, hold the worker slot and sleep out the window locally
    /// instead of sending the candidate back to `delayed`.
    pub worker_delay: bool,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            max: 0,
            duration: 1_000,
            group_key: None,
            worker_delay: false,
        }
    }
}

/// Options for a queue instance.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueOptions {
    /// Rate limiter shared by this queue's workers.
    pub limiter: Option<RateLimiterOptions>,
}

/// A named job to enqueue through [`Queue::add_bulk`].
#[derive(Clone, Debug)]
pub struct BulkJob {
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
}

/// Interface to a queue in Redis: validated enqueue plus the management surface.
///
/// Cheap to clone; clones share the multiplexed connection and the script library.
/// All state transitions go through [`Scripts`]; this type only issues read
/// commands directly.
#[derive(Clone)]
pub struct Queue {
    keys: QueueKeys,
    opts: QueueOptions,
    client: redis::Client,
    conn: MultiplexedConnection,
    scripts: Arc<Scripts>,
    closed: Arc<AtomicBool>,
}

impl Queue {
    /// Connect to Redis and bind a queue with the given name.
    pub async fn new(name: &str, config: &Config, opts: QueueOptions) -> GantryResult<Self> {
        if !QueueKeys::is_valid_name(name) {
            return Err(GantryError::invalid(
                "Invalid queue name, valid characters: a-zA-Z0-9_.-",
            ));
        }
        let keys = QueueKeys::new(config.key_prefix(), name);
        let (client, conn) = connect(config.redis_url()).await?;
        debug!("[{}] queue connected", keys.base());
        Ok(Self {
            scripts: Arc::new(Scripts::new(keys.clone())),
            keys,
            opts,
            client,
            conn,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        &self.keys.name
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn options(&self) -> &QueueOptions {
        &self.opts
    }

    pub(crate) fn scripts(&self) -> &Arc<Scripts> {
        &self.scripts
    }

    pub(crate) fn client(&self) -> &redis::Client {
        &self.client
    }

    pub(crate) fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn ensure_open(&self) -> GantryResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(GantryError::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// Refuse new operations on this queue handle. In-flight clones finish
    /// their current command; the connection is released once the last clone drops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Enqueue a job. Returns the job ID.
    pub async fn add(
        &self,
        name: &str,
        data: &serde_json::Value,
        opts: JobOptions,
    ) -> GantryResult<String> {
        self.ensure_open()?;
        let args = self.build_add_args(name, data, opts)?;
        let mut conn = self.conn.clone();
        let job_id = self.scripts.add_job(&mut conn, &args, now_ms()).await?;
        info!("[{}] job {} added", self.keys.base(), job_id);
        Ok(job_id)
    }

    /// Enqueue several jobs in one pipeline. Saves round trips; the adds are
    /// independent, not a transaction.
    pub async fn add_bulk(&self, jobs: Vec<BulkJob>) -> GantryResult<Vec<String>> {
        self.ensure_open()?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let now = now_ms();
        let args: Vec<AddJobArgs> = jobs
            .iter()
            .map(|job| self.build_add_args(&job.name, &job.data, job.opts.clone()))
            .collect::<GantryResult<_>>()?;

        let mut pipe = redis::pipe();
        let invocations: Vec<_> = args
            .iter()
            .map(|a| self.scripts.add_job_invocation(a, now))
            .collect();
        for invocation in &invocations {
            pipe.invoke_script(invocation);
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = pipe.query_async(&mut conn).await?;
        info!("[{}] {} jobs added in bulk", self.keys.base(), ids.len());
        Ok(ids)
    }

    /// Translate validated options into script arguments, resolving the rate-limit
    /// group suffix and repeat schedules.
    pub(crate) fn build_add_args(
        &self,
        name: &str,
        data: &serde_json::Value,
        opts: JobOptions,
    ) -> GantryResult<AddJobArgs> {
        opts.validate()?;
        let now = now_ms();
        let timestamp = opts.timestamp.unwrap_or(now);

        let mut custom_id = opts.job_id.clone();
        let mut delay = opts.delay;
        let mut repeat_job_key = None;
        if let Some(repeat) = &opts.repeat {
            let rjk = repeat.repeat_key(name);
            let slot = repeat.next_slot(now);
            // deterministic instance id: racing producers collapse onto one job
            custom_id = Some(format!("repeat:{}:{}", rjk, slot));
            delay = slot.saturating_sub(now);
            repeat_job_key = Some(rjk);
        }

        // group suffix comes from the payload; a missing field means the job
        // shares the default bucket and is not group-limited
        let group_suffix = self
            .opts
            .limiter
            .as_ref()
            .and_then(|limiter| limiter.group_key.as_deref())
            .and_then(|field| data.get(field))
            .and_then(|value| match value {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        let parent_key = opts.parent.as_ref().map(|parent| self.keys.job(&parent.id));
        let priority = opts.priority.unwrap_or(0);

        Ok(AddJobArgs {
            custom_id,
            group_suffix,
            name: name.to_owned(),
            data: serde_json::to_string(data)?,
            opts: serde_json::to_string(&opts)?,
            timestamp,
            delay,
            priority,
            lifo: opts.lifo,
            parent_key,
            repeat_job_key,
            waiting_children: false,
        })
    }

    pub(crate) async fn add_raw(&self, args: &AddJobArgs) -> GantryResult<String> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        self.scripts.add_job(&mut conn, args, now_ms()).await
    }

    /// Pause the queue: the paused flag flips and `wait` is swapped into `paused`
    /// atomically, so inflight workers observe a consistent view.
    pub async fn pause(&self) -> GantryResult<()> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        self.scripts.pause(&mut conn, true).await?;
        info!("[{}] paused", self.keys.base());
        Ok(())
    }

    pub async fn resume(&self) -> GantryResult<()> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        self.scripts.pause(&mut conn, false).await?;
        info!("[{}] resumed", self.keys.base());
        Ok(())
    }

    pub async fn is_paused(&self) -> GantryResult<bool> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let flag: Option<String> = conn.hget(&self.keys.meta, "paused").await?;
        Ok(flag.is_some())
    }

    /// Per-state job counts for the requested states; untouched states report zero.
    pub async fn counts(&self, states: &[State]) -> GantryResult<JobCounts> {
        self.ensure_open()?;
        let mut pipe = redis::pipe();
        for state in states {
            match state {
                State::Waiting => pipe.llen(&self.keys.wait),
                State::Paused => pipe.llen(&self.keys.paused),
                State::Active => pipe.llen(&self.keys.active),
                State::Delayed => pipe.zcard(&self.keys.delayed),
                State::WaitingChildren => pipe.zcard(&self.keys.waiting_children),
                State::Completed => pipe.zcard(&self.keys.completed),
                State::Failed => pipe.zcard(&self.keys.failed),
            };
        }
        let mut conn = self.conn.clone();
        let values: Vec<u64> = pipe.query_async(&mut conn).await?;
        let mut counts = JobCounts::default();
        for (state, count) in states.iter().zip(values) {
            counts.set(*state, count);
        }
        Ok(counts)
    }

    /// Fetch a job's full record, or `None` when the ID is unknown.
    pub async fn get_job(&self, job_id: &str) -> GantryResult<Option<Job>> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let map: std::collections::HashMap<String, String> =
            conn.hgetall(self.keys.job(job_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_hash(job_id, map)?))
    }

    /// Resolve which state container currently holds the job.
    pub async fn get_state(&self, job_id: &str) -> GantryResult<State> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.zscore(&self.keys.completed, job_id)
            .zscore(&self.keys.failed, job_id)
            .zscore(&self.keys.delayed, job_id)
            .zscore(&self.keys.waiting_children, job_id)
            .cmd("LPOS")
            .arg(&self.keys.active)
            .arg(job_id)
            .cmd("LPOS")
            .arg(&self.keys.wait)
            .arg(job_id)
            .cmd("LPOS")
            .arg(&self.keys.paused)
            .arg(job_id);
        #[allow(clippy::type_complexity)]
        let (completed, failed, delayed, waiting_children, active, wait, paused): (
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        ) = pipe.query_async(&mut conn).await?;

        if completed.is_some() {
            Ok(State::Completed)
        } else if failed.is_some() {
            Ok(State::Failed)
        } else if delayed.is_some() {
            Ok(State::Delayed)
        } else if waiting_children.is_some() {
            Ok(State::WaitingChildren)
        } else if active.is_some() {
            Ok(State::Active)
        } else if wait.is_some() {
            Ok(State::Waiting)
        } else if paused.is_some() {
            Ok(State::Paused)
        } else {
            Err(GantryError::NoSuchJob(job_id.to_owned()))
        }
    }

    pub async fn is_completed(&self, job_id: &str) -> GantryResult<bool> {
        Ok(self.get_state(job_id).await? == State::Completed)
    }

    pub async fn is_failed(&self, job_id: &str) -> GantryResult<bool> {
        Ok(self.get_state(job_id).await? == State::Failed)
    }

    pub async fn is_delayed(&self, job_id: &str) -> GantryResult<bool> {
        Ok(self.get_state(job_id).await? == State::Delayed)
    }

    pub async fn is_active(&self, job_id: &str) -> GantryResult<bool> {
        Ok(self.get_state(job_id).await? == State::Active)
    }

    pub async fn is_waiting(&self, job_id: &str) -> GantryResult<bool> {
        Ok(matches!(
            self.get_state(job_id).await?,
            State::Waiting | State::Paused
        ))
    }

    pub async fn is_waiting_children(&self, job_id: &str) -> GantryResult<bool> {
        Ok(self.get_state(job_id).await? == State::WaitingChildren)
    }

    /// Fetch jobs in the given states, oldest first unless `asc` is false.
    /// `end = -1` means "through the last job".
    pub async fn get_jobs(
        &self,
        states: &[State],
        start: usize,
        end: i64,
        asc: bool,
    ) -> GantryResult<Vec<Job>> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = Vec::new();
        for state in states {
            match state {
                State::Waiting => {
                    // head of the queue is the RPOP side; reverse to oldest-first
                    let mut list: Vec<String> = conn.lrange(&self.keys.wait, 0, -1).await?;
                    list.reverse();
                    ids.extend(list);
                }
                State::Paused => {
                    let mut list: Vec<String> = conn.lrange(&self.keys.paused, 0, -1).await?;
                    list.reverse();
                    ids.extend(list);
                }
                State::Active => {
                    let list: Vec<String> = conn.lrange(&self.keys.active, 0, -1).await?;
                    ids.extend(list);
                }
                State::Delayed => {
                    let list: Vec<String> = conn.zrange(&self.keys.delayed, 0, -1).await?;
                    ids.extend(list);
                }
                State::WaitingChildren => {
                    let list: Vec<String> =
                        conn.zrange(&self.keys.waiting_children, 0, -1).await?;
                    ids.extend(list);
                }
                State::Completed => {
                    let list: Vec<String> = conn.zrange(&self.keys.completed, 0, -1).await?;
                    ids.extend(list);
                }
                State::Failed => {
                    let list: Vec<String> = conn.zrange(&self.keys.failed, 0, -1).await?;
                    ids.extend(list);
                }
            }
        }

        let end = if end < 0 {
            ids.len()
        } else {
            ((end as usize) + 1).min(ids.len())
        };
        let start = start.min(end);
        let mut slice = ids[start..end].to_vec();
        if !asc {
            slice.reverse();
        }

        let mut jobs = Vec::with_capacity(slice.len());
        for job_id in &slice {
            let map: std::collections::HashMap<String, String> =
                conn.hgetall(self.keys.job(job_id)).await?;
            if !map.is_empty() {
                jobs.push(Job::from_hash(job_id, map)?);
            }
        }
        Ok(jobs)
    }

    /// Append a log line to a job. Returns the new number of log lines.
    pub async fn log(&self, job_id: &str, line: &str) -> GantryResult<u64> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.keys.job(job_id)).await?;
        if !exists {
            return Err(GantryError::NoSuchJob(job_id.to_owned()));
        }
        Ok(conn.rpush(self.keys.logs(job_id), line).await?)
    }

    /// Fetch a slice of a job's log lines plus the total count.
    pub async fn get_job_logs(
        &self,
        job_id: &str,
        start: isize,
        end: isize,
        asc: bool,
    ) -> GantryResult<(Vec<String>, u64)> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let key = self.keys.logs(job_id);
        let mut lines: Vec<String> = conn.lrange(&key, start, end).await?;
        if !asc {
            lines.reverse();
        }
        let total: u64 = conn.llen(&key).await?;
        Ok((lines, total))
    }

    pub async fn update_progress(
        &self,
        job_id: &str,
        progress: &serde_json::Value,
    ) -> GantryResult<()> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        self.scripts
            .update_progress(&mut conn, job_id, &serde_json::to_string(progress)?)
            .await
    }

    /// Record a successful verdict for a job the caller holds the lock on.
    /// Rejected with `LockMismatch` when `token` no longer owns the job.
    pub async fn move_to_completed(
        &self,
        job_id: &str,
        token: &str,
        returnvalue: &serde_json::Value,
    ) -> GantryResult<()> {
        self.ensure_open()?;
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| GantryError::NoSuchJob(job_id.to_owned()))?;
        let retention = &job.opts.remove_on_complete;
        let mut conn = self.conn.clone();
        self.scripts
            .move_to_completed(
                &mut conn,
                job_id,
                token,
                &serde_json::to_string(returnvalue)?,
                now_ms(),
                (
                    retention.removes_immediately(),
                    retention.keep_count().unwrap_or(0),
                    retention.max_age_ms().unwrap_or(0),
                ),
            )
            .await
            .map(|_| ())
    }

    /// Record a failed verdict for a job the caller holds the lock on. With
    /// `retry_delay` set the job re-enters `delayed`/`wait`; otherwise it fails
    /// terminally.
    pub async fn move_to_failed(
        &self,
        job_id: &str,
        token: &str,
        reason: &str,
        retry_delay: Option<u64>,
    ) -> GantryResult<()> {
        self.ensure_open()?;
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| GantryError::NoSuchJob(job_id.to_owned()))?;
        let retention = &job.opts.remove_on_fail;
        let stack_limit = job.opts.stack_trace_limit.unwrap_or(10);
        let mut conn = self.conn.clone();
        self.scripts
            .move_to_failed(
                &mut conn,
                job_id,
                token,
                reason,
                reason,
                stack_limit,
                now_ms(),
                retry_delay,
                (
                    retention.removes_immediately(),
                    retention.keep_count().unwrap_or(0),
                    retention.max_age_ms().unwrap_or(0),
                ),
            )
            .await
            .map(|_| ())
    }

    /// Re-queue a terminally failed job.
    pub async fn retry_job(&self, job_id: &str, reset_attempts: bool) -> GantryResult<()> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        self.scripts
            .retry_job(&mut conn, job_id, reset_attempts)
            .await
    }

    /// Remove a job from the queue entirely. Refused while a worker holds its lock.
    pub async fn remove(&self, job_id: &str) -> GantryResult<bool> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        self.scripts.remove_job(&mut conn, job_id).await
    }

    /// Bulk-delete jobs in `state` older than `grace_ms`. At most `limit` jobs are
    /// removed (0 = unbounded). Returns the removed IDs.
    pub async fn clean(
        &self,
        grace_ms: u64,
        limit: u64,
        state: State,
    ) -> GantryResult<Vec<String>> {
        self.ensure_open()?;
        let (container, kind) = match state {
            State::Completed => (&self.keys.completed, "completed"),
            State::Failed => (&self.keys.failed, "failed"),
            State::Delayed => (&self.keys.delayed, "delayed"),
            State::Waiting => (&self.keys.wait, "wait"),
            State::Paused => (&self.keys.paused, "paused"),
            State::Active | State::WaitingChildren => {
                return Err(GantryError::invalid(format!(
                    "Cannot clean jobs in state '{}'",
                    state
                )))
            }
        };
        let bound = now_ms().saturating_sub(grace_ms);
        let limit = if limit == 0 { 1_000_000 } else { limit };
        let mut conn = self.conn.clone();
        let removed = self
            .scripts
            .clean(&mut conn, container, kind, bound, limit)
            .await?;
        info!("[{}] cleaned {} {} jobs", self.keys.base(), removed.len(), kind);
        Ok(removed)
    }

    /// Delete all waiting and paused jobs, optionally delayed ones too. Active
    /// jobs are untouched.
    pub async fn drain(&self, include_delayed: bool) -> GantryResult<u64> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let dropped = self.scripts.drain(&mut conn, include_delayed).await?;
        info!("[{}] drained {} jobs", self.keys.base(), dropped);
        Ok(dropped)
    }

    /// Delete every key under the queue's namespace. Refused while jobs are
    /// active unless `force` is set.
    pub async fn obliterate(&self, force: bool) -> GantryResult<()> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let removed = self.scripts.obliterate(&mut conn, force).await?;
        info!("[{}] obliterated ({} keys)", self.keys.base(), removed);
        Ok(())
    }

    /// Client names of workers currently registered for this queue.
    pub async fn get_workers(&self) -> GantryResult<Vec<String>> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let listing: String = redis::cmd("CLIENT")
            .arg("LIST")
            .query_async(&mut conn)
            .await?;
        let prefix = format!("{}:{}:worker:", self.keys.prefix, self.keys.name);
        let workers = listing
            .lines()
            .filter_map(|line| {
                line.split(' ')
                    .find_map(|field| field.strip_prefix("name="))
                    .filter(|name| name.starts_with(&prefix))
                    .map(str::to_owned)
            })
            .collect();
        Ok(workers)
    }
}
