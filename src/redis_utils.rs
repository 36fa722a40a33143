//! Miscellaneous Redis utilities and helper functions.

use std::collections::HashMap;

use redis::aio::MultiplexedConnection;
use redis::{from_redis_value, FromRedisValue, RedisResult, Value};

use crate::models::GantryResult;

/// Open the shared non-blocking connection used by a queue instance.
pub async fn connect(url: &str) -> GantryResult<(redis::Client, MultiplexedConnection)> {
    let client = redis::Client::open(url)?;
    let conn = client.get_multiplexed_async_connection().await?;
    Ok((client, conn))
}

/// Current wall-clock time in ms since the epoch. Scripts receive time as an
/// argument so transitions are deterministic under replay.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Client name registered by a worker connection, surfaced by `CLIENT LIST`.
/// Redis forbids spaces in client names, hence the flat shape.
pub fn worker_client_name(prefix: &str, queue_name: &str, token: &str) -> String {
    let short = token.get(..8).unwrap_or(token);
    format!("{}:{}:worker:{}", prefix, queue_name, short)
}

/// Parse the flat `[field, value, field, value, …]` array scripts return for a
/// job hash (the shape of `HGETALL` inside Lua) into a map.
pub fn map_from_flat_pairs(v: &Value) -> RedisResult<HashMap<String, String>> {
    let items: Vec<String> = from_redis_value(v)?;
    let mut map = HashMap::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        map.insert(field, value);
    }
    Ok(map)
}

/// Helper for reading one element of a bulk script reply into a concrete type.
pub fn bulk_item<T: FromRedisValue>(items: &[Value], index: usize, what: &str) -> RedisResult<T> {
    match items.get(index) {
        Some(v) => from_redis_value(v),
        None => Err((
            redis::ErrorKind::TypeError,
            "truncated script reply",
            what.to_owned(),
        )
            .into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flat_pairs() {
        let v = Value::Array(vec![
            Value::BulkString(b"name".to_vec()),
            Value::BulkString(b"resize".to_vec()),
            Value::BulkString(b"delay".to_vec()),
            Value::BulkString(b"0".to_vec()),
        ]);
        let map = map_from_flat_pairs(&v).unwrap();
        assert_eq!(map.get("name").map(String::as_str), Some("resize"));
        assert_eq!(map.get("delay").map(String::as_str), Some("0"));
    }

    #[test]
    fn client_names() {
        let name = worker_client_name("gantry", "mail", "0a1b2c3d-ffff-0000-aaaa-bbbbccccdddd");
        assert_eq!(name, "gantry:mail:worker:0a1b2c3d");
    }
}
