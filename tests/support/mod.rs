//! Shared helpers for integration tests.
//!
//! Requires a running Redis server; set `REDIS_URL` to point at it (defaults to
//! redis://127.0.0.1). Every test works under its own random key prefix, so the
//! tests are isolated from each other and can run concurrently against one server.

#![allow(dead_code)]

use std::time::Duration;

use gantry::{Config, Queue, QueueOptions};

pub struct TestContext {
    pub config: Config,
}

impl TestContext {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = Config::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis.url = url;
        }
        config.redis.key_prefix = format!("gantry-test-{}", uuid::Uuid::new_v4().simple());
        Self { config }
    }

    pub async fn queue(&self, name: &str) -> Queue {
        Queue::new(name, &self.config, QueueOptions::default())
            .await
            .unwrap()
    }

    pub async fn queue_with(&self, name: &str, opts: QueueOptions) -> Queue {
        Queue::new(name, &self.config, opts).await.unwrap()
    }

    /// Remove everything the test wrote. Called at the end of tests that don't
    /// already obliterate as part of what they assert.
    pub async fn cleanup(&self, queue: &Queue) {
        let _ = queue.obliterate(true).await;
    }
}

/// Poll until `check` returns true or the timeout elapses. Returns whether the
/// condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
