//! Defines the set of state containers a job can occupy.

use std::fmt;
use std::str::FromStr;

use redis::{self, FromRedisValue, ToRedisArgs};
use serde::{Deserialize, Serialize};

const WAITING_STATE: &str = "waiting";
const PAUSED_STATE: &str = "paused";
const ACTIVE_STATE: &str = "active";
const DELAYED_STATE: &str = "delayed";
const WAITING_CHILDREN_STATE: &str = "waiting-children";
const COMPLETED_STATE: &str = "completed";
const FAILED_STATE: &str = "failed";

/// State of a job that exists in Redis. A job ID appears in exactly one of the
/// corresponding containers at any instant.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    /// Job is runnable, waiting for a worker to claim it.
    Waiting,

    /// Job is runnable but held back because the queue is paused.
    Paused,

    /// Job is currently leased by a worker under a live lock.
    Active,

    /// Job is scheduled to become runnable at a future time.
    Delayed,

    /// Job is blocked on unresolved child dependencies.
    WaitingChildren,

    /// Job finished successfully.
    Completed,

    /// Job failed with no retries remaining.
    Failed,
}

/// All job states, in the order counts are usually reported.
pub const ALL_STATES: [State; 7] = [
    State::Waiting,
    State::Paused,
    State::Active,
    State::Delayed,
    State::WaitingChildren,
    State::Completed,
    State::Failed,
];

impl State {
    /// Whether a job in this state has finished for good.
    pub fn is_finished(&self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for State {
    fn as_ref(&self) -> &str {
        match self {
            State::Waiting => WAITING_STATE,
            State::Paused => PAUSED_STATE,
            State::Active => ACTIVE_STATE,
            State::Delayed => DELAYED_STATE,
            State::WaitingChildren => WAITING_CHILDREN_STATE,
            State::Completed => COMPLETED_STATE,
            State::Failed => FAILED_STATE,
        }
    }
}

impl FromStr for State {
    type Err = ();

    fn from_str(s: &str) -> Result<State, ()> {
        match s {
            WAITING_STATE => Ok(State::Waiting),
            PAUSED_STATE => Ok(State::Paused),
            ACTIVE_STATE => Ok(State::Active),
            DELAYED_STATE => Ok(State::Delayed),
            WAITING_CHILDREN_STATE => Ok(State::WaitingChildren),
            COMPLETED_STATE => Ok(State::Completed),
            FAILED_STATE => Ok(State::Failed),
            _ => Err(()),
        }
    }
}

impl ToRedisArgs for State {
    fn write_redis_args<W: ?Sized + redis::RedisWrite>(&self, out: &mut W) {
        self.as_ref().write_redis_args(out)
    }
}

impl FromRedisValue for State {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let s = String::from_redis_value(v)?;
        State::from_str(&s).map_err(|_| (redis::ErrorKind::TypeError, "Invalid job state").into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Ensure all states correctly map to/from the same strings.
    #[test]
    fn state_to_from_str() {
        for state in &ALL_STATES {
            assert_eq!(state, &State::from_str(state.as_ref()).unwrap());
        }
    }

    #[test]
    fn serialisation() {
        assert_eq!(serde_json::to_string(&State::Waiting).unwrap(), "\"waiting\"");
        assert_eq!(
            serde_json::to_string(&State::WaitingChildren).unwrap(),
            "\"waiting-children\""
        );
        assert_eq!(serde_json::to_string(&State::Failed).unwrap(), "\"failed\"");
    }

    #[test]
    fn finished_states() {
        assert!(State::Completed.is_finished());
        assert!(State::Failed.is_finished());
        assert!(!State::Active.is_finished());
        assert!(!State::Delayed.is_finished());
    }
}
