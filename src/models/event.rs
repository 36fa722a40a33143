//! Lifecycle events published by the script library.
//!
//! Every transition appends a record to the queue's capped `events` stream and
//! publishes the same JSON on the channel of the same name, inside the same
//! atomic script region, so observers never see transitions out of order.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const ADDED_EVENT: &str = "added";
const WAITING_EVENT: &str = "waiting";
const ACTIVE_EVENT: &str = "active";
const PROGRESS_EVENT: &str = "progress";
const COMPLETED_EVENT: &str = "completed";
const FAILED_EVENT: &str = "failed";
const DELAYED_EVENT: &str = "delayed";
const STALLED_EVENT: &str = "stalled";
const PAUSED_EVENT: &str = "paused";
const RESUMED_EVENT: &str = "resumed";
const DRAINED_EVENT: &str = "drained";
const REMOVED_EVENT: &str = "removed";
const CLEANED_EVENT: &str = "cleaned";

/// Named lifecycle events recognised on a queue's events channel.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Added,
    Waiting,
    Active,
    Progress,
    Completed,
    Failed,
    Delayed,
    Stalled,
    Paused,
    Resumed,
    Drained,
    Removed,
    Cleaned,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for Event {
    fn as_ref(&self) -> &str {
        match self {
            Event::Added => ADDED_EVENT,
            Event::Waiting => WAITING_EVENT,
            Event::Active => ACTIVE_EVENT,
            Event::Progress => PROGRESS_EVENT,
            Event::Completed => COMPLETED_EVENT,
            Event::Failed => FAILED_EVENT,
            Event::Delayed => DELAYED_EVENT,
            Event::Stalled => STALLED_EVENT,
            Event::Paused => PAUSED_EVENT,
            Event::Resumed => RESUMED_EVENT,
            Event::Drained => DRAINED_EVENT,
            Event::Removed => REMOVED_EVENT,
            Event::Cleaned => CLEANED_EVENT,
        }
    }
}

impl FromStr for Event {
    type Err = ();

    fn from_str(s: &str) -> Result<Event, ()> {
        match s {
            ADDED_EVENT => Ok(Event::Added),
            WAITING_EVENT => Ok(Event::Waiting),
            ACTIVE_EVENT => Ok(Event::Active),
            PROGRESS_EVENT => Ok(Event::Progress),
            COMPLETED_EVENT => Ok(Event::Completed),
            FAILED_EVENT => Ok(Event::Failed),
            DELAYED_EVENT => Ok(Event::Delayed),
            STALLED_EVENT => Ok(Event::Stalled),
            PAUSED_EVENT => Ok(Event::Paused),
            RESUMED_EVENT => Ok(Event::Resumed),
            DRAINED_EVENT => Ok(Event::Drained),
            REMOVED_EVENT => Ok(Event::Removed),
            CLEANED_EVENT => Ok(Event::Cleaned),
            _ => Err(()),
        }
    }
}

/// A single message on the events channel: `{event, jobId, …metadata}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EventMessage {
    pub event: Event,

    #[serde(rename = "jobId", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    #[serde(flatten)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventMessage {
    /// Parse a pub/sub payload. Unknown event names yield `None` so subscribers
    /// can skip messages published by newer versions.
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}
