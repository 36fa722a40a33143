use std::fmt;
use std::str::FromStr;

use redis::{self, FromRedisValue, ToRedisArgs};
use serde::Serialize;

const NAME_FIELD: &str = "name";
const DATA_FIELD: &str = "data";
const OPTS_FIELD: &str = "opts";
const PRIORITY_FIELD: &str = "priority";
const PROGRESS_FIELD: &str = "progress";
const ATTEMPTS_MADE_FIELD: &str = "attemptsMade";
const RETURNVALUE_FIELD: &str = "returnvalue";
const FAILED_REASON_FIELD: &str = "failedReason";
const STACKTRACE_FIELD: &str = "stacktrace";
const TIMESTAMP_FIELD: &str = "timestamp";
const DELAY_FIELD: &str = "delay";
const PROCESSED_ON_FIELD: &str = "processedOn";
const FINISHED_ON_FIELD: &str = "finishedOn";
const PARENT_KEY_FIELD: &str = "parentKey";
const REPEAT_JOB_KEY_FIELD: &str = "rjk";
const STALLED_COUNTER_FIELD: &str = "stc";

/// Represents a job field that's stored in a Redis hash.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum Field {
    Name,
    Data,
    Opts,
    Priority,
    Progress,
    AttemptsMade,
    Returnvalue,
    FailedReason,
    Stacktrace,
    Timestamp,
    Delay,
    ProcessedOn,
    FinishedOn,
    ParentKey,
    RepeatJobKey,
    StalledCounter,
}

impl Field {
    pub fn all_fields() -> &'static [Field] {
        static ALL_FIELDS: [Field; 16] = [
            Field::Name,
            Field::Data,
            Field::Opts,
            Field::Priority,
            Field::Progress,
            Field::AttemptsMade,
            Field::Returnvalue,
            Field::FailedReason,
            Field::Stacktrace,
            Field::Timestamp,
            Field::Delay,
            Field::ProcessedOn,
            Field::FinishedOn,
            Field::ParentKey,
            Field::RepeatJobKey,
            Field::StalledCounter,
        ];

        &ALL_FIELDS
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for Field {
    fn as_ref(&self) -> &str {
        match self {
            Field::Name => NAME_FIELD,
            Field::Data => DATA_FIELD,
            Field::Opts => OPTS_FIELD,
            Field::Priority => PRIORITY_FIELD,
            Field::Progress => PROGRESS_FIELD,
            Field::AttemptsMade => ATTEMPTS_MADE_FIELD,
            Field::Returnvalue => RETURNVALUE_FIELD,
            Field::FailedReason => FAILED_REASON_FIELD,
            Field::Stacktrace => STACKTRACE_FIELD,
            Field::Timestamp => TIMESTAMP_FIELD,
            Field::Delay => DELAY_FIELD,
            Field::ProcessedOn => PROCESSED_ON_FIELD,
            Field::FinishedOn => FINISHED_ON_FIELD,
            Field::ParentKey => PARENT_KEY_FIELD,
            Field::RepeatJobKey => REPEAT_JOB_KEY_FIELD,
            Field::StalledCounter => STALLED_COUNTER_FIELD,
        }
    }
}

impl FromStr for Field {
    type Err = ();

    fn from_str(s: &str) -> Result<Field, ()> {
        match s {
            NAME_FIELD => Ok(Field::Name),
            DATA_FIELD => Ok(Field::Data),
            OPTS_FIELD => Ok(Field::Opts),
            PRIORITY_FIELD => Ok(Field::Priority),
            PROGRESS_FIELD => Ok(Field::Progress),
            ATTEMPTS_MADE_FIELD => Ok(Field::AttemptsMade),
            RETURNVALUE_FIELD => Ok(Field::Returnvalue),
            FAILED_REASON_FIELD => Ok(Field::FailedReason),
            STACKTRACE_FIELD => Ok(Field::Stacktrace),
            TIMESTAMP_FIELD => Ok(Field::Timestamp),
            DELAY_FIELD => Ok(Field::Delay),
            PROCESSED_ON_FIELD => Ok(Field::ProcessedOn),
            FINISHED_ON_FIELD => Ok(Field::FinishedOn),
            PARENT_KEY_FIELD => Ok(Field::ParentKey),
            REPEAT_JOB_KEY_FIELD => Ok(Field::RepeatJobKey),
            STALLED_COUNTER_FIELD => Ok(Field::StalledCounter),
            _ => Err(()),
        }
    }
}

impl ToRedisArgs for Field {
    fn write_redis_args<W: ?Sized + redis::RedisWrite>(&self, out: &mut W) {
        self.as_ref().write_redis_args(out)
    }
}

impl FromRedisValue for Field {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let s: String = String::from_redis_value(v)?;
        Field::from_str(&s).map_err(|_| (redis::ErrorKind::TypeError, "Invalid job field").into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Ensure all fields correctly map to/from the same strings.
    #[test]
    fn field_to_from_str() {
        for field in Field::all_fields() {
            assert_eq!(field, &Field::from_str(field.as_ref()).unwrap());
        }
    }
}
