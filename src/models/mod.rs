//! Data structures used throughout the crate.

pub mod job;

mod error;
mod event;

pub use self::error::{GantryError, GantryResult};
pub use self::event::{Event, EventMessage};
pub use self::job::{
    Backoff, Field, Job, JobOptions, Parent, RepeatOptions, Retention, State, ALL_STATES,
};

/// Per-state job counts for a queue, as reported by [`crate::Queue::counts`].
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub paused: u64,
    pub active: u64,
    pub delayed: u64,
    pub waiting_children: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn set(&mut self, state: State, count: u64) {
        match state {
            State::Waiting => self.waiting = count,
            State::Paused => self.paused = count,
            State::Active => self.active = count,
            State::Delayed => self.delayed = count,
            State::WaitingChildren => self.waiting_children = count,
            State::Completed => self.completed = count,
            State::Failed => self.failed = count,
        }
    }
}
