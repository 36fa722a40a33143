//! Distributed, durable job queue engine backed by Redis.
//!
//! Producers enqueue named jobs with optional delays, priorities, rate-limit
//! groups and parent/child relationships; workers atomically claim jobs through
//! server-side Lua scripts, execute them under a TTL-bounded lock, and report
//! completion or failure; a scheduler promotes delayed jobs and recovers stalled
//! ones. Execution is at-least-once with idempotent transitions.

pub mod config;
pub mod flow;
pub mod keys;
pub mod models;
pub mod queue;
pub mod redis_utils;
pub mod scheduler;
pub mod scripts;
pub mod worker;

pub use crate::config::Config;
pub use crate::flow::{FlowJobIds, FlowNode, FlowProducer};
pub use crate::models::{
    Backoff, Event, EventMessage, GantryError, GantryResult, Job, JobCounts, JobOptions, Parent,
    RepeatOptions, Retention, State,
};
pub use crate::queue::{BulkJob, Queue, QueueOptions, RateLimiterOptions};
pub use crate::scheduler::{QueueScheduler, SchedulerOptions};
pub use crate::worker::{ActiveJob, Processor, ProcessorError, Worker, WorkerOptions};
