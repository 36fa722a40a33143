//! Integration tests for delayed promotion, pause interaction and repeat
//! scheduling.
//!
//! Requires Redis; see `support` for connection configuration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use gantry::{
    ActiveJob, JobOptions, Processor, ProcessorError, QueueOptions, QueueScheduler, RepeatOptions,
    SchedulerOptions, State, Worker, WorkerOptions,
};

use crate::support::{wait_until, TestContext};

mod support;

struct Echo;

#[async_trait::async_trait]
impl Processor for Echo {
    async fn process(&self, job: &ActiveJob) -> Result<serde_json::Value, ProcessorError> {
        Ok(json!({ "echo": job.job.name }))
    }
}

#[tokio::test]
async fn delayed_jobs_promote_at_fire_time() {
    let ctx = TestContext::new();
    let queue = ctx.queue("timers").await;

    let scheduler = QueueScheduler::start("timers", &ctx.config, SchedulerOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let job_id = queue
        .add(
            "later",
            &json!({}),
            JobOptions {
                delay: 300,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(queue.get_state(&job_id).await.unwrap(), State::Delayed);

    let promoted = wait_until(Duration::from_secs(10), || async {
        queue.get_state(&job_id).await.unwrap() == State::Waiting
    })
    .await;
    assert!(promoted, "delayed job was not promoted");
    assert!(
        started.elapsed() >= Duration::from_millis(290),
        "promoted too early: {:?}",
        started.elapsed()
    );

    let job = queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.delay, 0);

    scheduler.close().await;
    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn delayed_jobs_stay_delayed_while_paused() {
    let ctx = TestContext::new();
    let queue = ctx.queue("pause-delay").await;
    let scheduler = QueueScheduler::start("pause-delay", &ctx.config, SchedulerOptions::default())
        .await
        .unwrap();

    queue.pause().await.unwrap();
    assert!(queue.is_paused().await.unwrap());
    let job_id = queue
        .add(
            "held",
            &json!({}),
            JobOptions {
                delay: 200,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let counts = queue.counts(&[State::Waiting, State::Delayed]).await.unwrap();
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.delayed, 1);

    // long past the fire time the job is still delayed: promotion holds off
    // until the queue resumes
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let counts = queue
        .counts(&[State::Waiting, State::Paused, State::Delayed])
        .await
        .unwrap();
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.paused, 0);
    assert_eq!(counts.delayed, 1);

    queue.resume().await.unwrap();
    let promoted = wait_until(Duration::from_secs(10), || async {
        queue.get_state(&job_id).await.unwrap() == State::Waiting
    })
    .await;
    assert!(promoted, "job was not promoted after resume");

    scheduler.close().await;
    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn repeat_schedule_spawns_instances_up_to_limit() {
    let ctx = TestContext::new();
    let queue = ctx.queue("heartbeat").await;

    let scheduler = QueueScheduler::start("heartbeat", &ctx.config, SchedulerOptions::default())
        .await
        .unwrap();
    let worker = Worker::start(
        "heartbeat",
        Arc::new(Echo),
        &ctx.config,
        QueueOptions::default(),
        WorkerOptions::default(),
    )
    .await
    .unwrap();

    queue
        .add(
            "tick",
            &json!({}),
            JobOptions {
                repeat: Some(RepeatOptions {
                    every: 400,
                    limit: Some(2),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let done = wait_until(Duration::from_secs(15), || async {
        queue.counts(&[State::Completed]).await.unwrap().completed == 2
    })
    .await;
    assert!(done, "repeat instances did not run");

    let jobs = queue.get_jobs(&[State::Completed], 0, -1, true).await.unwrap();
    assert!(jobs.iter().all(|j| j.id.starts_with("repeat:")));
    assert!(jobs.iter().all(|j| j.repeat_job_key.is_some()));

    // the limit stops the schedule: no third instance appears
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let counts = queue.counts(&[State::Completed, State::Delayed]).await.unwrap();
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.delayed, 0);

    worker.close(false).await;
    scheduler.close().await;
    ctx.cleanup(&queue).await;
}
