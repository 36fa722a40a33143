//! Integration tests for the producer and management API.
//!
//! Requires Redis; see `support` for connection configuration.

use std::sync::Arc;

use serde_json::json;

use gantry::{
    ActiveJob, Backoff, JobOptions, Processor, ProcessorError, QueueOptions, RateLimiterOptions,
    Retention, State, Worker, WorkerOptions,
};

use crate::support::TestContext;

mod support;

/// Processor that acknowledges every job without doing anything.
struct Noop;

#[async_trait::async_trait]
impl Processor for Noop {
    async fn process(&self, _job: &ActiveJob) -> Result<serde_json::Value, ProcessorError> {
        Ok(serde_json::Value::Null)
    }
}

fn manual_worker_opts() -> WorkerOptions {
    WorkerOptions {
        autorun: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn add_and_get_job_round_trip() {
    let ctx = TestContext::new();
    let queue = ctx.queue("round-trip").await;

    let opts = JobOptions {
        attempts: Some(3),
        backoff: Some(Backoff::Exponential { delay: 250 }),
        ..Default::default()
    };
    let data = json!({"to": "someone@example.com", "body": "hi"});
    let job_id = queue.add("send-mail", &data, opts.clone()).await.unwrap();

    let job = queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.id, job_id);
    assert_eq!(job.name, "send-mail");
    assert_eq!(job.data, data);
    assert_eq!(job.opts.attempts, opts.attempts);
    assert_eq!(job.opts.backoff, opts.backoff);
    assert_eq!(job.attempts_made, 0);
    assert!(job.timestamp > 0);

    assert_eq!(queue.get_state(&job_id).await.unwrap(), State::Waiting);
    let counts = queue.counts(&[State::Waiting, State::Active]).await.unwrap();
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.active, 0);

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn explicit_job_id_is_idempotent() {
    let ctx = TestContext::new();
    let queue = ctx.queue("idempotent").await;

    let opts = JobOptions {
        job_id: Some("ticket-99".to_owned()),
        ..Default::default()
    };
    let first = queue.add("audit", &json!({"seq": 1}), opts.clone()).await.unwrap();
    let second = queue.add("audit", &json!({"seq": 2}), opts).await.unwrap();
    assert_eq!(first, "ticket-99");
    assert_eq!(second, "ticket-99");

    // neither a duplicate entry nor mutated state
    let counts = queue.counts(&[State::Waiting]).await.unwrap();
    assert_eq!(counts.waiting, 1);
    let job = queue.get_job("ticket-99").await.unwrap().unwrap();
    assert_eq!(job.data, json!({"seq": 1}));

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn add_bulk_enqueues_all() {
    let ctx = TestContext::new();
    let queue = ctx.queue("bulk").await;

    let jobs = (0..10)
        .map(|i| gantry::BulkJob {
            name: "batch".to_owned(),
            data: json!({"i": i}),
            opts: JobOptions::default(),
        })
        .collect();
    let ids = queue.add_bulk(jobs).await.unwrap();
    assert_eq!(ids.len(), 10);

    let counts = queue.counts(&[State::Waiting]).await.unwrap();
    assert_eq!(counts.waiting, 10);

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn workers_pull_in_priority_order_then_fifo() {
    let ctx = TestContext::new();
    let queue = ctx.queue("prio").await;

    queue.add("plain-1", &json!({}), JobOptions::default()).await.unwrap();
    queue
        .add(
            "low",
            &json!({}),
            JobOptions {
                priority: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    queue
        .add(
            "urgent",
            &json!({}),
            JobOptions {
                priority: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    queue.add("plain-2", &json!({}), JobOptions::default()).await.unwrap();

    let worker = Worker::start(
        "prio",
        Arc::new(Noop),
        &ctx.config,
        QueueOptions::default(),
        manual_worker_opts(),
    )
    .await
    .unwrap();

    let order: Vec<String> = {
        let mut names = Vec::new();
        for _ in 0..4 {
            let job = worker.get_next_job().await.unwrap().unwrap();
            names.push(job.name);
        }
        names
    };
    assert_eq!(order, vec!["urgent", "low", "plain-1", "plain-2"]);
    assert!(worker.get_next_job().await.unwrap().is_none());

    worker.close(true).await;
    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn lifo_jobs_jump_the_queue() {
    let ctx = TestContext::new();
    let queue = ctx.queue("lifo").await;

    queue.add("first", &json!({}), JobOptions::default()).await.unwrap();
    queue
        .add(
            "last-in",
            &json!({}),
            JobOptions {
                lifo: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let worker = Worker::start(
        "lifo",
        Arc::new(Noop),
        &ctx.config,
        QueueOptions::default(),
        manual_worker_opts(),
    )
    .await
    .unwrap();

    let job = worker.get_next_job().await.unwrap().unwrap();
    assert_eq!(job.name, "last-in");

    worker.close(true).await;
    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn lock_ownership_is_exclusive() {
    let ctx = TestContext::new();
    let queue = ctx.queue("locks").await;
    queue.add("guarded", &json!({}), JobOptions::default()).await.unwrap();

    let worker = Worker::start(
        "locks",
        Arc::new(Noop),
        &ctx.config,
        QueueOptions::default(),
        manual_worker_opts(),
    )
    .await
    .unwrap();

    let job = worker.get_next_job().await.unwrap().unwrap();
    assert_eq!(queue.get_state(&job.id).await.unwrap(), State::Active);

    // a transition under the wrong token is rejected
    let err = queue
        .move_to_completed(&job.id, "not-the-owner", &json!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, gantry::GantryError::LockMismatch(_)));

    // the owner succeeds exactly once
    queue
        .move_to_completed(&job.id, worker.token(), &json!({"done": true}))
        .await
        .unwrap();
    let err = queue
        .move_to_completed(&job.id, worker.token(), &json!(2))
        .await
        .unwrap_err();
    assert!(matches!(err, gantry::GantryError::LockMismatch(_)));

    assert_eq!(queue.get_state(&job.id).await.unwrap(), State::Completed);
    let job = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.returnvalue, Some(json!({"done": true})));

    worker.close(true).await;
    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn failed_job_can_be_retried_and_completed() {
    let ctx = TestContext::new();
    let queue = ctx.queue("retry").await;
    let job_id = queue.add("flaky", &json!({}), JobOptions::default()).await.unwrap();

    let worker = Worker::start(
        "retry",
        Arc::new(Noop),
        &ctx.config,
        QueueOptions::default(),
        manual_worker_opts(),
    )
    .await
    .unwrap();

    let job = worker.get_next_job().await.unwrap().unwrap();
    queue
        .move_to_failed(&job.id, worker.token(), "exploded", None)
        .await
        .unwrap();
    assert_eq!(queue.get_state(&job_id).await.unwrap(), State::Failed);
    let record = queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(record.failed_reason.as_deref(), Some("exploded"));
    assert_eq!(record.attempts_made, 1);

    // retry only applies to failed jobs
    queue.retry_job(&job_id, true).await.unwrap();
    assert_eq!(queue.get_state(&job_id).await.unwrap(), State::Waiting);
    assert!(queue.retry_job(&job_id, false).await.is_err());

    let job = worker.get_next_job().await.unwrap().unwrap();
    assert_eq!(job.id, job_id);
    queue
        .move_to_completed(&job.id, worker.token(), &json!("fine"))
        .await
        .unwrap();
    assert_eq!(queue.get_state(&job_id).await.unwrap(), State::Completed);

    worker.close(true).await;
    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn remove_on_complete_discards_the_record() {
    let ctx = TestContext::new();
    let queue = ctx.queue("discard").await;
    let job_id = queue
        .add(
            "ephemeral",
            &json!({}),
            JobOptions {
                remove_on_complete: Retention::Remove(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let worker = Worker::start(
        "discard",
        Arc::new(Noop),
        &ctx.config,
        QueueOptions::default(),
        manual_worker_opts(),
    )
    .await
    .unwrap();

    let job = worker.get_next_job().await.unwrap().unwrap();
    queue
        .move_to_completed(&job.id, worker.token(), &json!(null))
        .await
        .unwrap();

    assert!(queue.get_job(&job_id).await.unwrap().is_none());
    let counts = queue.counts(&[State::Completed, State::Active]).await.unwrap();
    assert_eq!(counts.completed, 0);
    assert_eq!(counts.active, 0);

    worker.close(true).await;
    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn completed_set_is_trimmed_to_count() {
    let ctx = TestContext::new();
    let queue = ctx.queue("trim").await;
    for i in 0..5 {
        queue
            .add(
                "kept",
                &json!({ "i": i }),
                JobOptions {
                    remove_on_complete: Retention::Count(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let worker = Worker::start(
        "trim",
        Arc::new(Noop),
        &ctx.config,
        QueueOptions::default(),
        manual_worker_opts(),
    )
    .await
    .unwrap();
    for _ in 0..5 {
        let job = worker.get_next_job().await.unwrap().unwrap();
        queue
            .move_to_completed(&job.id, worker.token(), &json!(null))
            .await
            .unwrap();
    }

    let counts = queue.counts(&[State::Completed]).await.unwrap();
    assert_eq!(counts.completed, 2);

    worker.close(true).await;
    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn job_logs_append_and_slice() {
    let ctx = TestContext::new();
    let queue = ctx.queue("logs").await;
    let job_id = queue.add("chatty", &json!({}), JobOptions::default()).await.unwrap();

    assert_eq!(queue.log(&job_id, "starting").await.unwrap(), 1);
    assert_eq!(queue.log(&job_id, "halfway").await.unwrap(), 2);
    assert_eq!(queue.log(&job_id, "done").await.unwrap(), 3);

    let (lines, total) = queue.get_job_logs(&job_id, 0, -1, true).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(lines, vec!["starting", "halfway", "done"]);

    let (lines, _) = queue.get_job_logs(&job_id, 0, 1, false).await.unwrap();
    assert_eq!(lines, vec!["halfway", "starting"]);

    assert!(queue.log("no-such-job", "x").await.is_err());

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn update_progress_is_persisted() {
    let ctx = TestContext::new();
    let queue = ctx.queue("progress").await;
    let job_id = queue.add("tracked", &json!({}), JobOptions::default()).await.unwrap();

    queue
        .update_progress(&job_id, &json!({"pct": 42}))
        .await
        .unwrap();
    let job = queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.progress, json!({"pct": 42}));

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn remove_deletes_from_any_container() {
    let ctx = TestContext::new();
    let queue = ctx.queue("remove").await;

    let waiting = queue.add("w", &json!({}), JobOptions::default()).await.unwrap();
    let delayed = queue
        .add(
            "d",
            &json!({}),
            JobOptions {
                delay: 60_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(queue.remove(&waiting).await.unwrap());
    assert!(queue.remove(&delayed).await.unwrap());
    assert!(!queue.remove(&waiting).await.unwrap());

    let counts = queue.counts(&[State::Waiting, State::Delayed]).await.unwrap();
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.delayed, 0);

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn clean_removes_old_waiting_jobs() {
    let ctx = TestContext::new();
    let queue = ctx.queue("clean").await;
    for i in 0..4 {
        queue.add("stale", &json!({"i": i}), JobOptions::default()).await.unwrap();
    }

    let removed = queue.clean(0, 0, State::Waiting).await.unwrap();
    assert_eq!(removed.len(), 4);
    let counts = queue.counts(&[State::Waiting]).await.unwrap();
    assert_eq!(counts.waiting, 0);

    // active jobs can't be cleaned
    assert!(queue.clean(0, 0, State::Active).await.is_err());

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn drain_empties_waiting_and_delayed() {
    let ctx = TestContext::new();
    let queue = ctx.queue("drain").await;
    for _ in 0..3 {
        queue.add("doomed", &json!({}), JobOptions::default()).await.unwrap();
    }
    queue
        .add(
            "later",
            &json!({}),
            JobOptions {
                delay: 60_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let dropped = queue.drain(true).await.unwrap();
    assert_eq!(dropped, 4);
    let counts = queue.counts(&[State::Waiting, State::Delayed]).await.unwrap();
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.delayed, 0);

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn obliterate_leaves_no_keys_behind() {
    let ctx = TestContext::new();
    let queue = ctx.queue("obliterate").await;
    for i in 0..5 {
        queue.add("gone", &json!({"i": i}), JobOptions::default()).await.unwrap();
    }
    queue.log(&queue.add("logged", &json!({}), JobOptions::default()).await.unwrap(), "x")
        .await
        .unwrap();
    queue.pause().await.unwrap();

    queue.obliterate(false).await.unwrap();

    let client = redis::Client::open(ctx.config.redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let leftover: Vec<String> = redis::cmd("KEYS")
        .arg(queue.keys().namespace_pattern())
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(leftover.is_empty(), "leftover keys: {:?}", leftover);
}

#[tokio::test]
async fn obliterate_refuses_with_active_jobs() {
    let ctx = TestContext::new();
    let queue = ctx.queue("obliterate-active").await;
    queue.add("busy", &json!({}), JobOptions::default()).await.unwrap();

    let worker = Worker::start(
        "obliterate-active",
        Arc::new(Noop),
        &ctx.config,
        QueueOptions::default(),
        manual_worker_opts(),
    )
    .await
    .unwrap();
    let _job = worker.get_next_job().await.unwrap().unwrap();

    assert!(queue.obliterate(false).await.is_err());
    queue.obliterate(true).await.unwrap();

    worker.close(true).await;
}

#[tokio::test]
async fn group_key_suffixes_job_ids() {
    let ctx = TestContext::new();
    let opts = QueueOptions {
        limiter: Some(RateLimiterOptions {
            max: 1,
            duration: 1_000,
            group_key: Some("tenant".to_owned()),
            worker_delay: false,
        }),
    };
    let queue = ctx.queue_with("grouped", opts).await;

    let grouped = queue
        .add("task", &json!({"tenant": "acme"}), JobOptions::default())
        .await
        .unwrap();
    assert!(grouped.ends_with(":acme"), "id was {}", grouped);

    // a payload without the group field shares the default bucket: no suffix
    let ungrouped = queue
        .add("task", &json!({"other": 1}), JobOptions::default())
        .await
        .unwrap();
    assert!(!ungrouped.contains(':'), "id was {}", ungrouped);

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let ctx = TestContext::new();
    let queue = ctx.queue("validation").await;

    let err = queue
        .add(
            "bad",
            &json!({}),
            JobOptions {
                priority: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, gantry::GantryError::InvalidOptions(_)));

    let err = queue
        .add(
            "bad",
            &json!({}),
            JobOptions {
                attempts: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, gantry::GantryError::InvalidOptions(_)));

    ctx.cleanup(&queue).await;
}

#[tokio::test]
async fn closed_queue_refuses_operations() {
    let ctx = TestContext::new();
    let queue = ctx.queue("closed").await;
    queue.close();
    let err = queue.add("late", &json!({}), JobOptions::default()).await.unwrap_err();
    assert!(matches!(err, gantry::GantryError::ClientClosed));
}
