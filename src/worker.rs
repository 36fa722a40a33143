//! Worker: claims jobs from a queue and executes them in parallel slots.
//!
//! Each slot runs the user processor raced against a lock-renewal timer; losing
//! the lock cancels the processor cooperatively and abandons the job to stall
//! recovery. Pause, resume and close are coordinated through watch channels so
//! the fetch loop always has a wake-up to go with every flag change.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, timeout_at, Instant};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{GantryError, GantryResult, Job, Retention};
use crate::queue::{Queue, QueueOptions};
use crate::redis_utils::{now_ms, worker_client_name};
use crate::scripts::{Fetched, Finished, Scripts};

/// Error returned by a user processor. Recorded on the job as `failedReason` and
/// a stacktrace line, and drives the retry policy.
#[derive(Clone, Debug)]
pub struct ProcessorError {
    pub message: String,
}

impl ProcessorError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for ProcessorError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ProcessorError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// User-supplied job handler.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: &ActiveJob) -> Result<serde_json::Value, ProcessorError>;
}

/// A claimed job handed to the processor, with progress/log reporting bound to
/// the owning queue.
pub struct ActiveJob {
    pub job: Job,
    queue: Queue,
}

impl ActiveJob {
    pub async fn update_progress(&self, progress: &serde_json::Value) -> GantryResult<()> {
        self.queue.update_progress(&self.job.id, progress).await
    }

    pub async fn log(&self, line: &str) -> GantryResult<u64> {
        self.queue.log(&self.job.id, line).await
    }
}

/// Options for a worker instance.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerOptions {
    /// Start fetching as soon as the worker is constructed. With `false` the
    /// worker comes up paused; call [`Worker::resume`] to begin. Useful for tests
    /// driving [`Worker::get_next_job`] directly.
    pub autorun: bool,

    /// Number of jobs processed in parallel by this worker.
    pub concurrency: usize,

    /// Lock TTL in ms. A job whose lock expires without renewal is considered stalled.
    pub lock_duration: u64,

    /// Interval between lock renewals in ms. Defaults to half the lock duration.
    pub lock_renew_time: Option<u64>,

    /// Upper bound in ms on how long an idle worker sleeps before re-polling an
    /// empty or paused queue. Events on the queue channel wake it earlier.
    pub drain_delay: u64,

    /// Grace period in ms that `close()` waits for in-flight jobs before aborting them.
    pub shutdown_grace: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            autorun: true,
            concurrency: 1,
            lock_duration: 30_000,
            lock_renew_time: None,
            drain_delay: 5_000,
            shutdown_grace: 30_000,
        }
    }
}

impl WorkerOptions {
    fn lock_renew(&self) -> u64 {
        self.lock_renew_time.unwrap_or(self.lock_duration / 2).max(1)
    }
}

/// A process-local consumer executing jobs from one queue.
pub struct Worker {
    queue: Queue,
    token: String,
    opts: WorkerOptions,
    paused_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<Option<bool>>,
    inflight_rx: watch::Receiver<usize>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Connect, register a client name for `get_workers`, and start the fetch loop.
    pub async fn start(
        queue_name: &str,
        processor: Arc<dyn Processor>,
        config: &Config,
        queue_opts: QueueOptions,
        opts: WorkerOptions,
    ) -> GantryResult<Self> {
        let queue = Queue::new(queue_name, config, queue_opts).await?;
        let token = Uuid::new_v4().to_string();

        let client_name = worker_client_name(config.key_prefix(), queue_name, &token);
        let mut conn = queue.connection();
        let _: () = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(&client_name)
            .query_async(&mut conn)
            .await?;

        let (paused_tx, paused_rx) = watch::channel(!opts.autorun);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let (inflight_tx, inflight_rx) = watch::channel(0usize);

        let loop_queue = queue.clone();
        let loop_token = token.clone();
        let loop_opts = opts.clone();
        let handle = tokio::spawn(async move {
            main_loop(
                loop_queue,
                processor,
                loop_token,
                loop_opts,
                paused_rx,
                shutdown_rx,
                inflight_tx,
            )
            .await;
        });

        info!("[{}] worker {} started", queue.keys().base(), token);
        Ok(Self {
            queue,
            token,
            opts,
            paused_tx,
            shutdown_tx,
            inflight_rx,
            handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Stop fetching and wait until every in-flight job has resolved. After this
    /// returns, no further `active` transitions originate from this worker until
    /// [`Worker::resume`].
    pub async fn pause(&self) {
        let _ = self.paused_tx.send(true);
        let mut inflight = self.inflight_rx.clone();
        let _ = inflight.wait_for(|count| *count == 0).await;
        info!("[{}] worker {} paused", self.queue.keys().base(), self.token);
    }

    pub fn resume(&self) {
        let _ = self.paused_tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// Stop the fetch loop and wait for in-flight jobs bounded by the shutdown
    /// grace period. `force` aborts in-flight processors immediately; their jobs
    /// are recovered by the stall detector.
    pub async fn close(&self, force: bool) {
        let _ = self.shutdown_tx.send(Some(force));
        let handle = self.handle.lock().expect("worker handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.queue.close();
        info!("[{}] worker {} closed", self.queue.keys().base(), self.token);
    }

    /// Test hook: perform a single fetch with this worker's token, bypassing the loop.
    pub async fn get_next_job(&self) -> GantryResult<Option<Job>> {
        let mut conn = self.queue.connection();
        let fetched = self
            .queue
            .scripts()
            .move_to_active(
                &mut conn,
                &self.token,
                self.opts.lock_duration,
                now_ms(),
                limiter_args(&self.queue),
            )
            .await?;
        match fetched {
            Fetched::Job(job) => Ok(Some(*job)),
            _ => Ok(None),
        }
    }
}

fn limiter_args(queue: &Queue) -> Option<(u32, u64, bool)> {
    queue
        .options()
        .limiter
        .as_ref()
        .filter(|limiter| limiter.max > 0)
        .map(|limiter| (limiter.max, limiter.duration, limiter.group_key.is_some()))
}

fn retention_args(retention: &Retention) -> (bool, u64, u64) {
    (
        retention.removes_immediately(),
        retention.keep_count().unwrap_or(0),
        retention.max_age_ms().unwrap_or(0),
    )
}

#[allow(clippy::too_many_arguments)]
async fn main_loop(
    queue: Queue,
    processor: Arc<dyn Processor>,
    token: String,
    opts: WorkerOptions,
    mut paused_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<Option<bool>>,
    inflight_tx: watch::Sender<usize>,
) {
    let mut pubsub = match queue.client().get_async_pubsub().await {
        Ok(mut pubsub) => match pubsub.subscribe(&queue.keys().events).await {
            Ok(()) => Some(pubsub),
            Err(err) => {
                warn!("event subscription failed, falling back to polling: {}", err);
                None
            }
        },
        Err(err) => {
            warn!("event connection failed, falling back to polling: {}", err);
            None
        }
    };

    let limiter = limiter_args(&queue);
    let worker_delay = queue
        .options()
        .limiter
        .as_ref()
        .map(|l| l.worker_delay)
        .unwrap_or(false);
    let mut inflight: JoinSet<()> = JoinSet::new();

    loop {
        while inflight.try_join_next().is_some() {}
        let _ = inflight_tx.send(inflight.len());

        if shutdown_rx.borrow().is_some() {
            break;
        }

        if *paused_rx.borrow() || inflight.len() >= opts.concurrency {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = paused_rx.changed() => {}
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
            continue;
        }

        // count the fetch itself as occupancy, so a pause arriving while the
        // claim is in flight waits for its outcome instead of resolving early
        let _ = inflight_tx.send(inflight.len() + 1);
        let mut conn = queue.connection();
        let fetched = queue
            .scripts()
            .move_to_active(&mut conn, &token, opts.lock_duration, now_ms(), limiter)
            .await;

        match fetched {
            Ok(Fetched::Job(job)) => {
                debug!("[{}] claimed job {}", queue.keys().base(), job.id);
                let slot_queue = queue.clone();
                let slot_processor = processor.clone();
                let slot_token = token.clone();
                let slot_opts = opts.clone();
                inflight.spawn(async move {
                    run_job(slot_queue, slot_processor, *job, slot_token, slot_opts).await;
                });
            }
            Ok(Fetched::Empty) | Ok(Fetched::Paused) => {
                idle_wait(
                    pubsub.as_mut(),
                    opts.drain_delay,
                    &mut shutdown_rx,
                    &mut paused_rx,
                )
                .await;
            }
            Ok(Fetched::RateLimited(delay)) => {
                // workerDelay holds the slot for the whole window; otherwise nap
                // briefly and let the scheduler hand the job back via `delayed`
                let nap = if worker_delay {
                    delay
                } else {
                    delay.min(opts.lock_renew())
                };
                tokio::select! {
                    _ = sleep(Duration::from_millis(nap.max(1))) => {}
                    _ = shutdown_rx.changed() => {}
                    _ = paused_rx.changed() => {}
                }
            }
            Err(err) => {
                error!("[{}] fetch failed: {}", queue.keys().base(), err);
                tokio::select! {
                    _ = sleep(Duration::from_millis(1_000)) => {}
                    _ = shutdown_rx.changed() => {}
                    _ = paused_rx.changed() => {}
                }
            }
        }
    }

    // drain in-flight work, bounded by the grace period
    let force = shutdown_rx.borrow().unwrap_or(false);
    if force {
        inflight.abort_all();
    }
    let deadline = Instant::now() + Duration::from_millis(opts.shutdown_grace);
    loop {
        match timeout_at(deadline, inflight.join_next()).await {
            Ok(Some(_)) => {
                let _ = inflight_tx.send(inflight.len());
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "[{}] shutdown grace expired, aborting {} jobs",
                    queue.keys().base(),
                    inflight.len()
                );
                inflight.abort_all();
                while inflight.join_next().await.is_some() {}
                break;
            }
        }
    }
    let _ = inflight_tx.send(0);
}

/// Park until something worth re-polling for happens: an event on the queue
/// channel, a pause/shutdown flip, or the drain delay elapsing.
async fn idle_wait(
    pubsub: Option<&mut redis::aio::PubSub>,
    drain_delay: u64,
    shutdown_rx: &mut watch::Receiver<Option<bool>>,
    paused_rx: &mut watch::Receiver<bool>,
) {
    let nap = sleep(Duration::from_millis(drain_delay.max(1)));
    tokio::pin!(nap);
    match pubsub {
        Some(pubsub) => {
            let mut messages = pubsub.on_message();
            tokio::select! {
                _ = &mut nap => {}
                _ = messages.next() => {}
                _ = shutdown_rx.changed() => {}
                _ = paused_rx.changed() => {}
            }
        }
        None => {
            tokio::select! {
                _ = &mut nap => {}
                _ = shutdown_rx.changed() => {}
                _ = paused_rx.changed() => {}
            }
        }
    }
}

/// Run one claimed job to a verdict: the processor races the lock-renewal timer,
/// and a failed renewal cancels the processor by dropping its future.
async fn run_job(
    queue: Queue,
    processor: Arc<dyn Processor>,
    job: Job,
    token: String,
    opts: WorkerOptions,
) {
    let job_id = job.id.clone();
    let scripts: Arc<Scripts> = queue.scripts().clone();
    let active = ActiveJob {
        job,
        queue: queue.clone(),
    };

    let renew_every = Duration::from_millis(opts.lock_renew());
    let mut renew = interval_at(Instant::now() + renew_every, renew_every);

    let process = processor.process(&active);
    tokio::pin!(process);

    let outcome = loop {
        tokio::select! {
            result = &mut process => break Some(result),
            _ = renew.tick() => {
                let mut conn = queue.connection();
                match scripts.extend_lock(&mut conn, &job_id, &token, opts.lock_duration).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("[{}] lost lock on job {}, abandoning", queue.keys().base(), job_id);
                        break None;
                    }
                    Err(err) => {
                        warn!(
                            "[{}] lock renewal for job {} failed: {}",
                            queue.keys().base(), job_id, err
                        );
                        break None;
                    }
                }
            }
        }
    };

    let Some(result) = outcome else {
        // cancelled: stall recovery will hand the job to another worker
        return;
    };

    match result {
        Ok(value) => {
            let returnvalue =
                serde_json::to_string(&value).unwrap_or_else(|_| "null".to_owned());
            let retention = retention_args(&active.job.opts.remove_on_complete);
            let mut conn = queue.connection();
            match scripts
                .move_to_completed(&mut conn, &job_id, &token, &returnvalue, now_ms(), retention)
                .await
            {
                Ok(_) => {
                    debug!("[{}] job {} completed", queue.keys().base(), job_id);
                    reschedule_repeat(&queue, &active.job).await;
                }
                Err(GantryError::LockMismatch(_)) => {
                    warn!(
                        "[{}] completion of {} rejected, lock not owned",
                        queue.keys().base(),
                        job_id
                    );
                }
                Err(err) => error!(
                    "[{}] failed to record completion of {}: {}",
                    queue.keys().base(),
                    job_id,
                    err
                ),
            }
        }
        Err(failure) => {
            let attempts_next = active.job.attempts_made + 1;
            let retry_delay = active.job.retry_delay(attempts_next);
            let retention = retention_args(&active.job.opts.remove_on_fail);
            let stack_limit = active.job.opts.stack_trace_limit.unwrap_or(10);
            let mut conn = queue.connection();
            match scripts
                .move_to_failed(
                    &mut conn,
                    &job_id,
                    &token,
                    &failure.message,
                    &failure.message,
                    stack_limit,
                    now_ms(),
                    retry_delay,
                    retention,
                )
                .await
            {
                Ok(Finished::Failed(_)) => {
                    debug!("[{}] job {} failed terminally", queue.keys().base(), job_id);
                    reschedule_repeat(&queue, &active.job).await;
                }
                Ok(_) => {
                    debug!("[{}] job {} scheduled for retry", queue.keys().base(), job_id)
                }
                Err(GantryError::LockMismatch(_)) => {
                    warn!(
                        "[{}] failure of {} rejected, lock not owned",
                        queue.keys().base(),
                        job_id
                    );
                }
                Err(err) => error!(
                    "[{}] failed to record failure of {}: {}",
                    queue.keys().base(),
                    job_id,
                    err
                ),
            }
        }
    }
}

/// Enqueue the next occurrence of a repeatable job. The deterministic instance
/// id makes this idempotent when several workers finish instances concurrently.
async fn reschedule_repeat(queue: &Queue, job: &Job) {
    let Some(repeat) = &job.opts.repeat else {
        return;
    };
    let count = repeat.count + 1;
    if let Some(limit) = repeat.limit {
        if count >= limit {
            debug!(
                "[{}] repeat schedule for '{}' reached its limit",
                queue.keys().base(),
                job.name
            );
            return;
        }
    }
    let mut opts = job.opts.clone();
    opts.job_id = None;
    opts.delay = 0;
    opts.timestamp = None;
    opts.parent = None;
    if let Some(r) = opts.repeat.as_mut() {
        r.count = count;
    }
    if let Err(err) = queue.add(&job.name, &job.data, opts).await {
        error!(
            "[{}] failed to schedule next occurrence of '{}': {}",
            queue.keys().base(),
            job.name,
            err
        );
    }
}
