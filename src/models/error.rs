//! Defines basic error and result types used throughout the crate.

use std::{error::Error, fmt};

use redis::RedisError;

/// Result type used throughout the crate.
pub type GantryResult<T> = Result<T, GantryError>;

/// Error type used throughout the crate.
#[derive(Debug)]
pub enum GantryError {
    /// Error occurred during interaction with Redis.
    Redis(RedisError),

    /// A transition was attempted on a job the caller no longer owns. The job is left
    /// to stall recovery; the caller must abandon it.
    LockMismatch(String),

    /// Operation attempted on a job that does not exist.
    NoSuchJob(String),

    /// Job or queue options failed validation.
    InvalidOptions(String),

    /// Request was not valid due to the current state of some resource(s),
    /// e.g. obliterating a queue with active jobs.
    Conflict(String),

    /// The queue has been closed; in-flight operations reject and new ones are refused.
    ClientClosed,

    /// A server-side script returned a reply the client does not understand.
    /// Indicates a bug rather than a runtime condition.
    Script(String),

    /// Parsing of some data structure failed. Typically used when parsing JSON.
    Parse(String),
}

impl GantryError {
    /// Construct a new GantryError::Conflict with given message.
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        GantryError::Conflict(msg.into())
    }

    /// Construct a new GantryError::InvalidOptions with given message.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        GantryError::InvalidOptions(msg.into())
    }
}

impl From<RedisError> for GantryError {
    fn from(err: RedisError) -> Self {
        GantryError::Redis(err)
    }
}

impl From<serde_json::Error> for GantryError {
    fn from(err: serde_json::Error) -> Self {
        GantryError::Parse(err.to_string())
    }
}

impl fmt::Display for GantryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GantryError::Redis(err) => err.fmt(f),
            GantryError::LockMismatch(job_id) => {
                write!(f, "Lock on job {} is not owned by this worker", job_id)
            }
            GantryError::NoSuchJob(job_id) => write!(f, "Job with ID {} does not exist", job_id),
            GantryError::ClientClosed => write!(f, "Queue connection has been closed"),
            GantryError::Script(msg) => write!(f, "Unexpected script reply: {}", msg),
            GantryError::Parse(msg) => write!(f, "Parse error: {}", msg),
            GantryError::InvalidOptions(msg) | GantryError::Conflict(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for GantryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GantryError::Redis(err) => err.source(),
            _ => None,
        }
    }
}
