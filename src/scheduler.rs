//! Scheduler: promotes delayed jobs and recovers stalled ones.
//!
//! One instance per queue is enough; running several is safe but wasteful, since
//! the stall check's interval CAS and the idempotent promotion both tolerate
//! concurrent schedulers.

use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::Config;
use crate::models::{Event, EventMessage, GantryResult};
use crate::queue::{Queue, QueueOptions};
use crate::redis_utils::now_ms;

/// Fallback poll interval when no delayed job is scheduled or the event
/// subscription is unavailable.
const PROMOTION_FALLBACK_MS: u64 = 5_000;

/// Options for a scheduler instance.
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerOptions {
    /// How often active jobs are checked for expired locks, in ms.
    pub stalled_interval: u64,

    /// How many times a job may stall before it is failed terminally.
    pub max_stalled_count: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            stalled_interval: 30_000,
            max_stalled_count: 1,
        }
    }
}

/// Singleton-per-queue recovery loop: delayed promotion plus stall detection.
pub struct QueueScheduler {
    queue: Queue,
    shutdown_tx: watch::Sender<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl QueueScheduler {
    pub async fn start(
        queue_name: &str,
        config: &Config,
        opts: SchedulerOptions,
    ) -> GantryResult<Self> {
        let queue = Queue::new(queue_name, config, QueueOptions::default()).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let loop_queue = queue.clone();
        let handle = tokio::spawn(async move {
            main_loop(loop_queue, opts, shutdown_rx).await;
        });

        info!("[{}] scheduler started", queue.keys().base());
        Ok(Self {
            queue,
            shutdown_tx,
            handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().expect("scheduler handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.queue.close();
        info!("[{}] scheduler closed", self.queue.keys().base());
    }
}

async fn main_loop(queue: Queue, opts: SchedulerOptions, mut shutdown_rx: watch::Receiver<bool>) {
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

    let stall_every = Duration::from_millis(opts.stalled_interval.max(1));
    let mut next_stall = Instant::now();
    let mut next_promote = Instant::now();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let now_instant = Instant::now();

        if now_instant >= next_stall {
            let mut conn = queue.connection();
            match queue
                .scripts()
                .move_stalled_jobs(
                    &mut conn,
                    now_ms(),
                    opts.stalled_interval,
                    opts.max_stalled_count,
                )
                .await
            {
                Ok((failed, recovered)) => {
                    if !failed.is_empty() || !recovered.is_empty() {
                        info!(
                            "[{}] stall check: {} recovered, {} failed",
                            queue.keys().base(),
                            recovered.len(),
                            failed.len()
                        );
                    }
                }
                Err(err) => error!("[{}] stall check failed: {}", queue.keys().base(), err),
            }
            next_stall = now_instant + stall_every;
        }

        if now_instant >= next_promote {
            let mut conn = queue.connection();
            match queue.scripts().promote_delayed(&mut conn, now_ms()).await {
                Ok((count, next_fire_ms)) => {
                    if count > 0 {
                        debug!("[{}] promoted {} delayed jobs", queue.keys().base(), count);
                    }
                    let wall_now = now_ms();
                    next_promote = if next_fire_ms > wall_now {
                        // a `delayed` event wakes us earlier when something nearer lands
                        let wait = next_fire_ms - wall_now;
                        now_instant + Duration::from_millis(wait.min(opts.stalled_interval))
                    } else {
                        // nothing scheduled, or overdue jobs held back by a paused
                        // queue: fall back to the poll interval
                        now_instant + Duration::from_millis(PROMOTION_FALLBACK_MS)
                    };
                }
                Err(err) => {
                    error!("[{}] delayed promotion failed: {}", queue.keys().base(), err);
                    next_promote = now_instant + Duration::from_millis(1_000);
                }
            }
        }

        let deadline = next_stall.min(next_promote);
        match pubsub.as_mut() {
            Some(pubsub) => {
                let mut messages = pubsub.on_message();
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = shutdown_rx.changed() => {}
                    Some(msg) = messages.next() => {
                        if let Ok(payload) = msg.get_payload::<String>() {
                            if let Some(event) = EventMessage::parse(&payload) {
                                // a new delayed job may fire sooner than the current
                                // timer; resume re-enables promotion outright
                                if matches!(event.event, Event::Delayed | Event::Resumed) {
                                    next_promote = Instant::now();
                                }
                            }
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }
}
