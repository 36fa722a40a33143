//! The atomic transition library.
//!
//! Every non-trivial state change is a single server-side Lua script executed
//! atomically against Redis; the scripts here are the only writers of the state
//! containers enumerated in [`crate::keys`]. Each script takes the queue's keys as a
//! fixed-order vector plus arguments, and returns a small tagged reply that the
//! typed wrappers below translate into Rust values.
//!
//! Events are appended to the capped `events` stream and published on the channel
//! of the same name from inside the scripts, so observers see state changes and
//! their events in the same serialization order.

use redis::aio::ConnectionLike;
use redis::{Script, Value};

use crate::keys::QueueKeys;
use crate::models::{GantryError, GantryResult, Job};
use crate::redis_utils::{bulk_item, map_from_flat_pairs};

/// Approximate cap on the events stream.
const EVENTS_MAXLEN: u32 = 10_000;

/// Cap on the per-queue metrics data points.
const METRICS_MAXLEN: u32 = 10_000;

/// Batch bound for a single delayed-promotion pass.
const PROMOTE_BATCH: u32 = 1_000;

/// Delayed-set scores shift the fire time past 12 bits of priority, so equal
/// fire times order by priority. The constant is substituted into the Lua
/// helpers below; all encoding and decoding goes through them.
const PRIORITY_SCALE: u64 = 4_096;

/// Lua helpers shared by the transition scripts. Concatenated in front of each
/// script body that needs them.
const HELPERS: &str = r#"
local function emit(events_key, event, job_id, extra_field, extra_value)
  local entry = {"event", event}
  local payload = {event = event}
  if job_id then
    entry[#entry + 1] = "jobId"
    entry[#entry + 1] = job_id
    payload["jobId"] = job_id
  end
  if extra_field then
    entry[#entry + 1] = extra_field
    entry[#entry + 1] = tostring(extra_value)
    payload[extra_field] = extra_value
  end
  redis.call("XADD", events_key, "MAXLEN", "~", EVENTS_MAXLEN, "*", unpack(entry))
  redis.call("PUBLISH", events_key, cjson.encode(payload))
end

local function delayed_score(fire_at, priority)
  return fire_at * PRIORITY_SCALE + math.min(priority, PRIORITY_SCALE - 1)
end

local function score_fire_time(score)
  return math.floor(score / PRIORITY_SCALE)
end

-- Everything due at or before `now` scores below this.
local function promotion_bound(now)
  return delayed_score(now + 1, 0) - 1
end

-- While the queue is paused, runnable jobs accumulate in `paused` so the
-- wait <-> paused RENAME swap stays lossless.
local function target_list(meta_key, wait_key, paused_key)
  if redis.call("HGET", meta_key, "paused") then
    return paused_key
  end
  return wait_key
end

local function push_runnable(job_key, job_id, list_key, priority_key, events_key)
  local prio = tonumber(redis.call("HGET", job_key, "priority") or "0") or 0
  if prio > 0 then
    redis.call("ZADD", priority_key, prio, job_id)
  end
  redis.call("LPUSH", list_key, job_id)
  emit(events_key, "waiting", job_id)
end

local function record_metric(metrics_key, now)
  redis.call("INCR", metrics_key)
  redis.call("LPUSH", metrics_key .. ":data", now)
  redis.call("LTRIM", metrics_key .. ":data", 0, METRICS_MAXLEN - 1)
end

local function trim_finished(set_key, base, keep_count, max_age, now)
  if keep_count > 0 then
    local excess = redis.call("ZCARD", set_key) - keep_count
    if excess > 0 then
      local old = redis.call("ZRANGE", set_key, 0, excess - 1)
      for i = 1, #old do
        redis.call("DEL", base .. ":" .. old[i], base .. ":" .. old[i] .. ":logs")
      end
      redis.call("ZREMRANGEBYRANK", set_key, 0, excess - 1)
    end
  end
  if max_age > 0 then
    local bound = now - max_age
    local old = redis.call("ZRANGEBYSCORE", set_key, "-inf", bound)
    for i = 1, #old do
      redis.call("DEL", base .. ":" .. old[i], base .. ":" .. old[i] .. ":logs")
    end
    redis.call("ZREMRANGEBYSCORE", set_key, "-inf", bound)
  end
end

-- Child completion resolves one dependency edge; the parent leaves
-- waiting-children once its dependency set drains.
local function resolve_dependency(base, job_key, wchildren_key, wait_key, paused_key,
                                  meta_key, priority_key, events_key)
  local parent_key = redis.call("HGET", job_key, "parentKey")
  if parent_key then
    local parent_id = string.sub(parent_key, string.len(base) + 2)
    local deps_key = parent_key .. ":dependencies"
    redis.call("SREM", deps_key, job_key)
    if redis.call("SCARD", deps_key) == 0
        and redis.call("ZREM", wchildren_key, parent_id) == 1 then
      local target = target_list(meta_key, wait_key, paused_key)
      push_runnable(parent_key, parent_id, target, priority_key, events_key)
    end
  end
end

-- Terminal failure: record, index, emit, then walk the dependency edge.
-- A waiting parent either discards the edge (ignoreDependencyOnFailure on the
-- child) or fails itself, recursively up the tree.
local fail_terminal
fail_terminal = function(base, job_key, job_id, reason, now, failed_key, wchildren_key,
                         wait_key, paused_key, meta_key, priority_key, events_key, metrics_key)
  redis.call("HSET", job_key, "failedReason", reason, "finishedOn", now)
  redis.call("ZADD", failed_key, now, job_id)
  record_metric(metrics_key, now)
  emit(events_key, "failed", job_id, "failedReason", reason)
  local parent_key = redis.call("HGET", job_key, "parentKey")
  if parent_key then
    local parent_id = string.sub(parent_key, string.len(base) + 2)
    local deps_key = parent_key .. ":dependencies"
    local ignore = false
    local raw_opts = redis.call("HGET", job_key, "opts")
    if raw_opts then
      local ok, opts = pcall(cjson.decode, raw_opts)
      if ok and type(opts) == "table" and opts["ignoreDependencyOnFailure"] then
        ignore = true
      end
    end
    if ignore then
      redis.call("SREM", deps_key, job_key)
      if redis.call("SCARD", deps_key) == 0
          and redis.call("ZREM", wchildren_key, parent_id) == 1 then
        local target = target_list(meta_key, wait_key, paused_key)
        push_runnable(parent_key, parent_id, target, priority_key, events_key)
      end
    elseif redis.call("ZREM", wchildren_key, parent_id) == 1 then
      fail_terminal(base, parent_key, parent_id, "parent failed", now, failed_key,
                    wchildren_key, wait_key, paused_key, meta_key, priority_key,
                    events_key, metrics_key)
    end
  end
end
"#;

/// KEYS: [1] id counter, [2] wait, [3] paused, [4] meta, [5] priority, [6] delayed,
///       [7] waiting-children, [8] events, [9] repeat
/// ARGV: [1] base, [2] custom id ("" = allocate), [3] group suffix, [4] name,
///       [5] data, [6] opts, [7] timestamp ms, [8] delay ms, [9] priority,
///       [10] lifo flag, [11] parent key, [12] repeat-job key,
///       [13] waiting-children flag, [14] now ms
///
/// Returns the job id. An existing id returns as-is without mutation, which makes
/// adds with an explicit id idempotent.
const ADD_JOB: &str = r#"
local base = ARGV[1]
local job_id = ARGV[2]
if job_id == "" then
  job_id = tostring(redis.call("INCR", KEYS[1]))
end
if ARGV[3] ~= "" then
  job_id = job_id .. ":" .. ARGV[3]
end
local job_key = base .. ":" .. job_id
if redis.call("EXISTS", job_key) == 1 then
  return job_id
end
local timestamp = tonumber(ARGV[7])
local delay = tonumber(ARGV[8])
local priority = tonumber(ARGV[9])
redis.call("HSET", job_key,
  "name", ARGV[4],
  "data", ARGV[5],
  "opts", ARGV[6],
  "timestamp", timestamp,
  "delay", delay,
  "priority", priority,
  "attemptsMade", 0)
if ARGV[11] ~= "" then
  redis.call("HSET", job_key, "parentKey", ARGV[11])
  redis.call("SADD", ARGV[11] .. ":dependencies", job_key)
end
if ARGV[12] ~= "" then
  redis.call("HSET", job_key, "rjk", ARGV[12])
  redis.call("ZADD", KEYS[9], timestamp + delay, ARGV[12])
end
emit(KEYS[8], "added", job_id)
if delay > 0 then
  redis.call("ZADD", KEYS[6], delayed_score(timestamp + delay, priority), job_id)
  emit(KEYS[8], "delayed", job_id, "delay", delay)
elseif ARGV[13] == "1" and redis.call("SCARD", job_key .. ":dependencies") > 0 then
  redis.call("ZADD", KEYS[7], tonumber(ARGV[14]), job_id)
else
  if priority > 0 then
    redis.call("ZADD", KEYS[5], priority, job_id)
  end
  local target = target_list(KEYS[4], KEYS[2], KEYS[3])
  if ARGV[10] == "1" then
    redis.call("RPUSH", target, job_id)
  else
    redis.call("LPUSH", target, job_id)
  end
  emit(KEYS[8], "waiting", job_id)
end
return job_id
"#;

/// KEYS: [1] wait, [2] active, [3] priority, [4] meta, [5] limiter, [6] delayed,
///       [7] events
/// ARGV: [1] base, [2] worker token, [3] lock duration ms, [4] now ms,
///       [5] limiter max (0 = off), [6] limiter duration ms, [7] grouped flag
///
/// Prioritised candidates win ties over wait order. Over-quota candidates move
/// back to `delayed` scored at the bucket's reset time.
const MOVE_TO_ACTIVE: &str = r#"
if redis.call("HGET", KEYS[4], "paused") then
  return {"paused"}
end
local job_id
local prioritized = redis.call("ZRANGE", KEYS[3], 0, 0)
if prioritized[1] then
  job_id = prioritized[1]
  redis.call("ZREM", KEYS[3], job_id)
  redis.call("LREM", KEYS[1], 1, job_id)
else
  job_id = redis.call("RPOP", KEYS[1])
end
if not job_id then
  return {"empty"}
end
local base = ARGV[1]
local now = tonumber(ARGV[4])
local job_key = base .. ":" .. job_id
local max = tonumber(ARGV[5])
if max > 0 then
  local bucket = KEYS[5]
  if ARGV[7] == "1" then
    local group = string.match(job_id, ":([^:]+)$")
    if group then
      bucket = KEYS[5] .. ":" .. group
    end
  end
  local tokens = redis.call("INCR", bucket)
  if tokens == 1 then
    redis.call("PEXPIRE", bucket, ARGV[6])
  end
  if tokens > max then
    local delay = redis.call("PTTL", bucket)
    if delay < 0 then
      delay = tonumber(ARGV[6])
    end
    local prio = tonumber(redis.call("HGET", job_key, "priority") or "0") or 0
    redis.call("ZADD", KEYS[6], delayed_score(now + delay, prio), job_id)
    emit(KEYS[7], "delayed", job_id, "delay", delay)
    return {"rate-limited", delay}
  end
end
if redis.call("EXISTS", job_key) == 0 then
  return {"empty"}
end
redis.call("RPUSH", KEYS[2], job_id)
redis.call("SET", job_key .. ":lock", ARGV[2], "PX", ARGV[3])
redis.call("HSET", job_key, "processedOn", now)
emit(KEYS[7], "active", job_id)
return {"ok", job_id, redis.call("HGETALL", job_key)}
"#;

/// KEYS: [1] active, [2] completed, [3] wait, [4] paused, [5] meta, [6] priority,
///       [7] waiting-children, [8] events, [9] metrics:completed
/// ARGV: [1] base, [2] job id, [3] token, [4] returnvalue, [5] now ms,
///       [6] remove flag, [7] keep count, [8] max age ms
const MOVE_TO_COMPLETED: &str = r#"
local base = ARGV[1]
local job_id = ARGV[2]
local job_key = base .. ":" .. job_id
if redis.call("EXISTS", job_key) == 0 then
  return {"missing"}
end
local lock_key = job_key .. ":lock"
if redis.call("GET", lock_key) ~= ARGV[3] then
  return {"lock-mismatch"}
end
redis.call("DEL", lock_key)
if redis.call("LREM", KEYS[1], 1, job_id) == 0 then
  return {"lock-mismatch"}
end
local now = tonumber(ARGV[5])
redis.call("HSET", job_key, "returnvalue", ARGV[4], "finishedOn", now)
redis.call("SREM", base .. ":stalled", job_id)
emit(KEYS[8], "completed", job_id)
record_metric(KEYS[9], now)
resolve_dependency(base, job_key, KEYS[7], KEYS[3], KEYS[4], KEYS[5], KEYS[6], KEYS[8])
if ARGV[6] == "1" then
  redis.call("DEL", job_key, job_key .. ":logs", job_key .. ":dependencies")
else
  redis.call("ZADD", KEYS[2], now, job_id)
  trim_finished(KEYS[2], base, tonumber(ARGV[7]), tonumber(ARGV[8]), now)
end
return {"ok"}
"#;

/// KEYS: [1] active, [2] failed, [3] wait, [4] paused, [5] meta, [6] priority,
///       [7] waiting-children, [8] delayed, [9] events, [10] metrics:failed
/// ARGV: [1] base, [2] job id, [3] token, [4] reason, [5] stack line,
///       [6] stack limit, [7] now ms, [8] retry delay ms (-1 = terminal),
///       [9] remove flag, [10] keep count, [11] max age ms
const MOVE_TO_FAILED: &str = r#"
local base = ARGV[1]
local job_id = ARGV[2]
local job_key = base .. ":" .. job_id
if redis.call("EXISTS", job_key) == 0 then
  return {"missing"}
end
local lock_key = job_key .. ":lock"
if redis.call("GET", lock_key) ~= ARGV[3] then
  return {"lock-mismatch"}
end
redis.call("DEL", lock_key)
if redis.call("LREM", KEYS[1], 1, job_id) == 0 then
  return {"lock-mismatch"}
end
local now = tonumber(ARGV[7])
local attempts = redis.call("HINCRBY", job_key, "attemptsMade", 1)
redis.call("SREM", base .. ":stalled", job_id)
if ARGV[5] ~= "" then
  local limit = tonumber(ARGV[6])
  local stack = {}
  local raw = redis.call("HGET", job_key, "stacktrace")
  if raw then
    local ok, decoded = pcall(cjson.decode, raw)
    if ok and type(decoded) == "table" then
      stack = decoded
    end
  end
  table.insert(stack, 1, ARGV[5])
  while #stack > limit do
    table.remove(stack)
  end
  redis.call("HSET", job_key, "stacktrace", cjson.encode(stack))
end
redis.call("HSET", job_key, "failedReason", ARGV[4])
local retry_delay = tonumber(ARGV[8])
if retry_delay >= 0 then
  if retry_delay > 0 then
    local prio = tonumber(redis.call("HGET", job_key, "priority") or "0") or 0
    redis.call("ZADD", KEYS[8], delayed_score(now + retry_delay, prio), job_id)
    emit(KEYS[9], "delayed", job_id, "delay", retry_delay)
  else
    local target = target_list(KEYS[5], KEYS[3], KEYS[4])
    push_runnable(job_key, job_id, target, KEYS[6], KEYS[9])
  end
  return {"retry", attempts}
end
fail_terminal(base, job_key, job_id, ARGV[4], now, KEYS[2], KEYS[7], KEYS[3], KEYS[4],
              KEYS[5], KEYS[6], KEYS[9], KEYS[10])
if ARGV[9] == "1" then
  redis.call("ZREM", KEYS[2], job_id)
  redis.call("DEL", job_key, job_key .. ":logs", job_key .. ":dependencies")
else
  trim_finished(KEYS[2], base, tonumber(ARGV[10]), tonumber(ARGV[11]), now)
end
return {"failed", attempts}
"#;

/// KEYS: [1] failed, [2] wait, [3] paused, [4] meta, [5] priority, [6] events
/// ARGV: [1] base, [2] job id, [3] reset-attempts flag
const RETRY_JOB: &str = r#"
if redis.call("ZREM", KEYS[1], ARGV[2]) == 0 then
  return {"not-failed"}
end
local job_key = ARGV[1] .. ":" .. ARGV[2]
redis.call("HDEL", job_key, "failedReason", "finishedOn", "processedOn")
if ARGV[3] == "1" then
  redis.call("HSET", job_key, "attemptsMade", 0)
end
local target = target_list(KEYS[4], KEYS[2], KEYS[3])
push_runnable(job_key, ARGV[2], target, KEYS[5], KEYS[6])
return {"ok"}
"#;

/// KEYS: [1] stalled
/// ARGV: [1] base, [2] job id, [3] token, [4] duration ms
///
/// Returns 1 when the lock was refreshed, 0 on mismatch (the worker must abandon).
const EXTEND_LOCK: &str = r#"
local lock_key = ARGV[1] .. ":" .. ARGV[2] .. ":lock"
if redis.call("GET", lock_key) == ARGV[3] then
  redis.call("PEXPIRE", lock_key, ARGV[4])
  redis.call("SREM", KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

/// KEYS: [1] events
/// ARGV: [1] base, [2] job id, [3] progress JSON
const UPDATE_PROGRESS: &str = r#"
local job_key = ARGV[1] .. ":" .. ARGV[2]
if redis.call("EXISTS", job_key) == 0 then
  return {"missing"}
end
redis.call("HSET", job_key, "progress", ARGV[3])
emit(KEYS[1], "progress", ARGV[2], "data", ARGV[3])
return {"ok"}
"#;

/// KEYS: [1] delayed, [2] wait, [3] meta, [4] priority, [5] events
/// ARGV: [1] base, [2] now ms, [3] batch limit
///
/// Returns {promoted count, fire time of the next delayed job in ms (0 = none)}.
/// No-ops while the queue is paused, so delayed jobs stay delayed until resume.
const PROMOTE_DELAYED: &str = r#"
local function next_fire_time(delayed_key)
  local head = redis.call("ZRANGE", delayed_key, 0, 0, "WITHSCORES")
  if head[2] then
    return score_fire_time(tonumber(head[2]))
  end
  return 0
end
if redis.call("HGET", KEYS[3], "paused") then
  return {0, next_fire_time(KEYS[1])}
end
local bound = promotion_bound(tonumber(ARGV[2]))
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", bound, "LIMIT", 0, tonumber(ARGV[3]))
for i = 1, #due do
  redis.call("ZREM", KEYS[1], due[i])
  local job_key = ARGV[1] .. ":" .. due[i]
  redis.call("HSET", job_key, "delay", 0)
  push_runnable(job_key, due[i], KEYS[2], KEYS[4], KEYS[5])
end
return {#due, next_fire_time(KEYS[1])}
"#;

/// KEYS: [1] stalled, [2] stalled-check, [3] active, [4] wait, [5] paused,
///       [6] meta, [7] failed, [8] priority, [9] waiting-children, [10] events,
///       [11] metrics:failed
/// ARGV: [1] base, [2] now ms, [3] stalled interval ms, [4] max stalled count
///
/// The interval check doubles as a CAS: under N schedulers only the first caller
/// per interval performs the sweep. Returns {terminally failed ids, recovered ids}.
const MOVE_STALLED: &str = r#"
local now = tonumber(ARGV[2])
local last = redis.call("GET", KEYS[2])
if last and now - tonumber(last) < tonumber(ARGV[3]) then
  return {{}, {}}
end
redis.call("SET", KEYS[2], now)
local failed = {}
local recovered = {}
local snapshot = redis.call("SMEMBERS", KEYS[1])
for i = 1, #snapshot do
  local job_id = snapshot[i]
  local job_key = ARGV[1] .. ":" .. job_id
  if redis.call("EXISTS", job_key .. ":lock") == 0
      and redis.call("LREM", KEYS[3], 1, job_id) == 1 then
    local stalls = redis.call("HINCRBY", job_key, "stc", 1)
    if stalls > tonumber(ARGV[4]) then
      fail_terminal(ARGV[1], job_key, job_id, "job stalled more than allowable limit",
                    now, KEYS[7], KEYS[9], KEYS[4], KEYS[5], KEYS[6], KEYS[8],
                    KEYS[10], KEYS[11])
      failed[#failed + 1] = job_id
    else
      local prio = tonumber(redis.call("HGET", job_key, "priority") or "0") or 0
      if prio > 0 then
        redis.call("ZADD", KEYS[8], prio, job_id)
      end
      local target = target_list(KEYS[6], KEYS[4], KEYS[5])
      redis.call("RPUSH", target, job_id)
      emit(KEYS[10], "stalled", job_id)
      recovered[#recovered + 1] = job_id
    end
  end
end
redis.call("DEL", KEYS[1])
local active = redis.call("LRANGE", KEYS[3], 0, -1)
if #active > 0 then
  redis.call("SADD", KEYS[1], unpack(active))
end
return {failed, recovered}
"#;

/// KEYS: [1] wait, [2] paused, [3] meta, [4] events
/// ARGV: [1] "pause" | "resume"
const PAUSE_RESUME: &str = r#"
local function merge_into(src, dst)
  local id = redis.call("RPOPLPUSH", src, dst)
  while id do
    id = redis.call("RPOPLPUSH", src, dst)
  end
end
if ARGV[1] == "pause" then
  if redis.call("EXISTS", KEYS[2]) == 1 then
    merge_into(KEYS[1], KEYS[2])
  elseif redis.call("EXISTS", KEYS[1]) == 1 then
    redis.call("RENAME", KEYS[1], KEYS[2])
  end
  redis.call("HSET", KEYS[3], "paused", 1)
  emit(KEYS[4], "paused")
else
  if redis.call("EXISTS", KEYS[1]) == 1 then
    merge_into(KEYS[2], KEYS[1])
  elseif redis.call("EXISTS", KEYS[2]) == 1 then
    redis.call("RENAME", KEYS[2], KEYS[1])
  end
  redis.call("HDEL", KEYS[3], "paused")
  emit(KEYS[4], "resumed")
end
return 1
"#;

/// KEYS: [1] wait, [2] paused, [3] active, [4] delayed, [5] priority,
///       [6] completed, [7] failed, [8] waiting-children, [9] events, [10] meta
/// ARGV: [1] base, [2] job id
const REMOVE_JOB: &str = r#"
local base = ARGV[1]
local job_id = ARGV[2]
local job_key = base .. ":" .. job_id
if redis.call("EXISTS", job_key .. ":lock") == 1 then
  return {"locked"}
end
local existed = redis.call("EXISTS", job_key) == 1
resolve_dependency(base, job_key, KEYS[8], KEYS[1], KEYS[2], KEYS[10], KEYS[5], KEYS[9])
redis.call("LREM", KEYS[1], 0, job_id)
redis.call("LREM", KEYS[2], 0, job_id)
redis.call("LREM", KEYS[3], 0, job_id)
redis.call("ZREM", KEYS[4], job_id)
redis.call("ZREM", KEYS[5], job_id)
redis.call("ZREM", KEYS[6], job_id)
redis.call("ZREM", KEYS[7], job_id)
redis.call("ZREM", KEYS[8], job_id)
redis.call("DEL", job_key, job_key .. ":logs", job_key .. ":dependencies")
if existed then
  emit(KEYS[9], "removed", job_id)
  return {"ok"}
end
return {"missing"}
"#;

/// KEYS: [1] container, [2] events, [3] priority
/// ARGV: [1] base, [2] container kind, [3] bound timestamp ms, [4] limit
///
/// Returns the ids removed.
const CLEAN: &str = r#"
local removed = {}
local base = ARGV[1]
local limit = tonumber(ARGV[4])
local function drop(job_id)
  local job_key = base .. ":" .. job_id
  redis.call("DEL", job_key, job_key .. ":logs", job_key .. ":dependencies")
  removed[#removed + 1] = job_id
end
if ARGV[2] == "completed" or ARGV[2] == "failed" then
  local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[3], "LIMIT", 0, limit)
  for i = 1, #ids do
    redis.call("ZREM", KEYS[1], ids[i])
    drop(ids[i])
  end
elseif ARGV[2] == "delayed" then
  local bound = promotion_bound(tonumber(ARGV[3]))
  local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", bound, "LIMIT", 0, limit)
  for i = 1, #ids do
    redis.call("ZREM", KEYS[1], ids[i])
    drop(ids[i])
  end
else
  local ids = redis.call("LRANGE", KEYS[1], 0, -1)
  for i = 1, #ids do
    if #removed >= limit then
      break
    end
    local job_key = base .. ":" .. ids[i]
    local ts = tonumber(redis.call("HGET", job_key, "timestamp") or "0") or 0
    if ts <= tonumber(ARGV[3]) then
      redis.call("LREM", KEYS[1], 1, ids[i])
      redis.call("ZREM", KEYS[3], ids[i])
      drop(ids[i])
    end
  end
end
emit(KEYS[2], "cleaned", nil, "count", #removed)
return removed
"#;

/// KEYS: [1] wait, [2] paused, [3] priority, [4] delayed, [5] events
/// ARGV: [1] base, [2] include-delayed flag
const DRAIN: &str = r#"
local base = ARGV[1]
local dropped = 0
local function drop_list(list_key)
  local ids = redis.call("LRANGE", list_key, 0, -1)
  for i = 1, #ids do
    local job_key = base .. ":" .. ids[i]
    redis.call("DEL", job_key, job_key .. ":logs", job_key .. ":dependencies")
  end
  redis.call("DEL", list_key)
  return #ids
end
dropped = drop_list(KEYS[1]) + drop_list(KEYS[2])
redis.call("DEL", KEYS[3])
if ARGV[2] == "1" then
  local ids = redis.call("ZRANGE", KEYS[4], 0, -1)
  for i = 1, #ids do
    local job_key = base .. ":" .. ids[i]
    redis.call("DEL", job_key, job_key .. ":logs", job_key .. ":dependencies")
  end
  dropped = dropped + #ids
  redis.call("DEL", KEYS[4])
end
emit(KEYS[5], "drained")
return dropped
"#;

/// KEYS: [1] active
/// ARGV: [1] namespace pattern, [2] force flag
///
/// Returns -1 when refused because jobs are still active, else the number of keys
/// deleted. The namespace shares one hash slot, so the SCAN sweep is complete.
const OBLITERATE: &str = r#"
if ARGV[2] ~= "1" and redis.call("LLEN", KEYS[1]) > 0 then
  return -1
end
local cursor = "0"
local removed = 0
repeat
  local result = redis.call("SCAN", cursor, "MATCH", ARGV[1], "COUNT", 1000)
  cursor = result[1]
  if #result[2] > 0 then
    removed = removed + redis.call("DEL", unpack(result[2]))
  end
until cursor == "0"
return removed
"#;

/// Reply from a fetch attempt against the head of the queue.
#[derive(Debug)]
pub enum Fetched {
    /// A job was claimed; the lock is held under the worker's token.
    Job(Box<Job>),

    /// Nothing runnable.
    Empty,

    /// The queue-level paused flag is set.
    Paused,

    /// The rate limiter is over quota; retry after roughly this many ms.
    RateLimited(u64),
}

/// Reply from a completion/failure transition.
#[derive(Debug, Eq, PartialEq)]
pub enum Finished {
    /// Transition applied.
    Ok,

    /// Job failed but will retry; carries the new attemptsMade.
    Retry(u32),

    /// Job failed terminally; carries the final attemptsMade.
    Failed(u32),
}

/// Arguments to [`Scripts::add_job`], assembled by the producer.
#[derive(Clone, Debug, Default)]
pub struct AddJobArgs {
    pub custom_id: Option<String>,
    pub group_suffix: Option<String>,
    pub name: String,
    pub data: String,
    pub opts: String,
    pub timestamp: u64,
    pub delay: u64,
    pub priority: u32,
    pub lifo: bool,
    pub parent_key: Option<String>,
    pub repeat_job_key: Option<String>,
    pub waiting_children: bool,
}

/// The script library bound to one queue's keyspace.
///
/// Script sources are composed with the shared helper block once at construction;
/// `redis::Script` handles EVALSHA caching and NOSCRIPT reloads.
pub struct Scripts {
    keys: QueueKeys,
    add_job: Script,
    move_to_active: Script,
    move_to_completed: Script,
    move_to_failed: Script,
    retry_job: Script,
    extend_lock: Script,
    update_progress: Script,
    promote_delayed: Script,
    move_stalled: Script,
    pause_resume: Script,
    remove_job: Script,
    clean: Script,
    drain: Script,
    obliterate: Script,
}

fn compose(body: &str) -> Script {
    let helpers = HELPERS
        .replace("EVENTS_MAXLEN", &EVENTS_MAXLEN.to_string())
        .replace("METRICS_MAXLEN", &METRICS_MAXLEN.to_string())
        .replace("PRIORITY_SCALE", &PRIORITY_SCALE.to_string());
    Script::new(&[helpers.as_str(), body].concat())
}

impl Scripts {
    pub fn new(keys: QueueKeys) -> Self {
        Self {
            keys,
            add_job: compose(ADD_JOB),
            move_to_active: compose(MOVE_TO_ACTIVE),
            move_to_completed: compose(MOVE_TO_COMPLETED),
            move_to_failed: compose(MOVE_TO_FAILED),
            retry_job: compose(RETRY_JOB),
            extend_lock: Script::new(EXTEND_LOCK),
            update_progress: compose(UPDATE_PROGRESS),
            promote_delayed: compose(PROMOTE_DELAYED),
            move_stalled: compose(MOVE_STALLED),
            pause_resume: compose(PAUSE_RESUME),
            remove_job: compose(REMOVE_JOB),
            clean: compose(CLEAN),
            drain: compose(DRAIN),
            obliterate: Script::new(OBLITERATE),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Build the invocation for an add without executing it, so bulk adds can
    /// pipeline several invocations in one round trip.
    pub fn add_job_invocation(&self, args: &AddJobArgs, now: u64) -> redis::ScriptInvocation<'_> {
        let k = &self.keys;
        let mut inv = self.add_job.prepare_invoke();
        inv.key(&k.id)
            .key(&k.wait)
            .key(&k.paused)
            .key(&k.meta)
            .key(&k.priority)
            .key(&k.delayed)
            .key(&k.waiting_children)
            .key(&k.events)
            .key(&k.repeat)
            .arg(k.base())
            .arg(args.custom_id.as_deref().unwrap_or(""))
            .arg(args.group_suffix.as_deref().unwrap_or(""))
            .arg(&args.name)
            .arg(&args.data)
            .arg(&args.opts)
            .arg(args.timestamp)
            .arg(args.delay)
            .arg(args.priority)
            .arg(if args.lifo { "1" } else { "0" })
            .arg(args.parent_key.as_deref().unwrap_or(""))
            .arg(args.repeat_job_key.as_deref().unwrap_or(""))
            .arg(if args.waiting_children { "1" } else { "0" })
            .arg(now);
        inv
    }

    pub async fn add_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        args: &AddJobArgs,
        now: u64,
    ) -> GantryResult<String> {
        Ok(self.add_job_invocation(args, now).invoke_async(conn).await?)
    }

    pub async fn move_to_active<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        token: &str,
        lock_duration: u64,
        now: u64,
        limiter: Option<(u32, u64, bool)>,
    ) -> GantryResult<Fetched> {
        let k = &self.keys;
        let (max, duration, grouped) = limiter.unwrap_or((0, 0, false));
        let reply: Value = self
            .move_to_active
            .prepare_invoke()
            .key(&k.wait)
            .key(&k.active)
            .key(&k.priority)
            .key(&k.meta)
            .key(&k.limiter)
            .key(&k.delayed)
            .key(&k.events)
            .arg(k.base())
            .arg(token)
            .arg(lock_duration)
            .arg(now)
            .arg(max)
            .arg(duration)
            .arg(if grouped { "1" } else { "0" })
            .invoke_async(conn)
            .await?;

        let items = match reply {
            Value::Array(items) => items,
            other => return Err(GantryError::Script(format!("{:?}", other))),
        };
        let tag: String = bulk_item(&items, 0, "fetch tag")?;
        match tag.as_str() {
            "ok" => {
                let job_id: String = bulk_item(&items, 1, "job id")?;
                let map = map_from_flat_pairs(items.get(2).ok_or_else(|| {
                    GantryError::Script("fetch reply missing job hash".to_owned())
                })?)?;
                Ok(Fetched::Job(Box::new(Job::from_hash(&job_id, map)?)))
            }
            "empty" => Ok(Fetched::Empty),
            "paused" => Ok(Fetched::Paused),
            "rate-limited" => {
                let delay: i64 = bulk_item(&items, 1, "limiter delay")?;
                Ok(Fetched::RateLimited(delay.max(0) as u64))
            }
            other => Err(GantryError::Script(other.to_owned())),
        }
    }

    pub async fn move_to_completed<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        token: &str,
        returnvalue: &str,
        now: u64,
        retention: (bool, u64, u64),
    ) -> GantryResult<Finished> {
        let k = &self.keys;
        let (remove, keep_count, max_age) = retention;
        let reply: Value = self
            .move_to_completed
            .prepare_invoke()
            .key(&k.active)
            .key(&k.completed)
            .key(&k.wait)
            .key(&k.paused)
            .key(&k.meta)
            .key(&k.priority)
            .key(&k.waiting_children)
            .key(&k.events)
            .key(&k.metrics_completed)
            .arg(k.base())
            .arg(job_id)
            .arg(token)
            .arg(returnvalue)
            .arg(now)
            .arg(if remove { "1" } else { "0" })
            .arg(keep_count)
            .arg(max_age)
            .invoke_async(conn)
            .await?;
        self.parse_finished(job_id, reply)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn move_to_failed<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        token: &str,
        reason: &str,
        stack_line: &str,
        stack_limit: usize,
        now: u64,
        retry_delay: Option<u64>,
        retention: (bool, u64, u64),
    ) -> GantryResult<Finished> {
        let k = &self.keys;
        let (remove, keep_count, max_age) = retention;
        let retry: i64 = retry_delay.map(|d| d as i64).unwrap_or(-1);
        let reply: Value = self
            .move_to_failed
            .prepare_invoke()
            .key(&k.active)
            .key(&k.failed)
            .key(&k.wait)
            .key(&k.paused)
            .key(&k.meta)
            .key(&k.priority)
            .key(&k.waiting_children)
            .key(&k.delayed)
            .key(&k.events)
            .key(&k.metrics_failed)
            .arg(k.base())
            .arg(job_id)
            .arg(token)
            .arg(reason)
            .arg(stack_line)
            .arg(stack_limit)
            .arg(now)
            .arg(retry)
            .arg(if remove { "1" } else { "0" })
            .arg(keep_count)
            .arg(max_age)
            .invoke_async(conn)
            .await?;
        self.parse_finished(job_id, reply)
    }

    fn parse_finished(&self, job_id: &str, reply: Value) -> GantryResult<Finished> {
        let items = match reply {
            Value::Array(items) => items,
            other => return Err(GantryError::Script(format!("{:?}", other))),
        };
        let tag: String = bulk_item(&items, 0, "finish tag")?;
        match tag.as_str() {
            "ok" => Ok(Finished::Ok),
            "retry" => {
                let attempts: u32 = bulk_item(&items, 1, "attempts")?;
                Ok(Finished::Retry(attempts))
            }
            "failed" => {
                let attempts: u32 = bulk_item(&items, 1, "attempts")?;
                Ok(Finished::Failed(attempts))
            }
            "lock-mismatch" => Err(GantryError::LockMismatch(job_id.to_owned())),
            "missing" => Err(GantryError::NoSuchJob(job_id.to_owned())),
            other => Err(GantryError::Script(other.to_owned())),
        }
    }

    pub async fn retry_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        reset_attempts: bool,
    ) -> GantryResult<()> {
        let k = &self.keys;
        let reply: Value = self
            .retry_job
            .prepare_invoke()
            .key(&k.failed)
            .key(&k.wait)
            .key(&k.paused)
            .key(&k.meta)
            .key(&k.priority)
            .key(&k.events)
            .arg(k.base())
            .arg(job_id)
            .arg(if reset_attempts { "1" } else { "0" })
            .invoke_async(conn)
            .await?;
        let items = match reply {
            Value::Array(items) => items,
            other => return Err(GantryError::Script(format!("{:?}", other))),
        };
        let tag: String = bulk_item(&items, 0, "retry tag")?;
        match tag.as_str() {
            "ok" => Ok(()),
            "not-failed" => Err(GantryError::conflict(format!(
                "Job {} is not in the failed set",
                job_id
            ))),
            other => Err(GantryError::Script(other.to_owned())),
        }
    }

    /// Worker heartbeat. Returns false when the lock is no longer owned.
    pub async fn extend_lock<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        token: &str,
        duration: u64,
    ) -> GantryResult<bool> {
        let k = &self.keys;
        let refreshed: i64 = self
            .extend_lock
            .prepare_invoke()
            .key(&k.stalled)
            .arg(k.base())
            .arg(job_id)
            .arg(token)
            .arg(duration)
            .invoke_async(conn)
            .await?;
        Ok(refreshed == 1)
    }

    pub async fn update_progress<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
        progress: &str,
    ) -> GantryResult<()> {
        let k = &self.keys;
        let reply: Value = self
            .update_progress
            .prepare_invoke()
            .key(&k.events)
            .arg(k.base())
            .arg(job_id)
            .arg(progress)
            .invoke_async(conn)
            .await?;
        let items = match reply {
            Value::Array(items) => items,
            other => return Err(GantryError::Script(format!("{:?}", other))),
        };
        let tag: String = bulk_item(&items, 0, "progress tag")?;
        match tag.as_str() {
            "ok" => Ok(()),
            "missing" => Err(GantryError::NoSuchJob(job_id.to_owned())),
            other => Err(GantryError::Script(other.to_owned())),
        }
    }

    /// Returns (promoted count, next fire time in ms, 0 when nothing is scheduled).
    pub async fn promote_delayed<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        now: u64,
    ) -> GantryResult<(u64, u64)> {
        let k = &self.keys;
        let (count, next): (u64, u64) = self
            .promote_delayed
            .prepare_invoke()
            .key(&k.delayed)
            .key(&k.wait)
            .key(&k.meta)
            .key(&k.priority)
            .key(&k.events)
            .arg(k.base())
            .arg(now)
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await?;
        Ok((count, next))
    }

    /// Returns (terminally failed ids, recovered ids). Both empty when another
    /// scheduler already checked within the interval.
    pub async fn move_stalled_jobs<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        now: u64,
        stalled_interval: u64,
        max_stalled_count: u32,
    ) -> GantryResult<(Vec<String>, Vec<String>)> {
        let k = &self.keys;
        let (failed, recovered): (Vec<String>, Vec<String>) = self
            .move_stalled
            .prepare_invoke()
            .key(&k.stalled)
            .key(&k.stalled_check)
            .key(&k.active)
            .key(&k.wait)
            .key(&k.paused)
            .key(&k.meta)
            .key(&k.failed)
            .key(&k.priority)
            .key(&k.waiting_children)
            .key(&k.events)
            .key(&k.metrics_failed)
            .arg(k.base())
            .arg(now)
            .arg(stalled_interval)
            .arg(max_stalled_count)
            .invoke_async(conn)
            .await?;
        Ok((failed, recovered))
    }

    pub async fn pause<C: ConnectionLike + Send>(&self, conn: &mut C, pause: bool) -> GantryResult<()> {
        let k = &self.keys;
        let _: i64 = self
            .pause_resume
            .prepare_invoke()
            .key(&k.wait)
            .key(&k.paused)
            .key(&k.meta)
            .key(&k.events)
            .arg(if pause { "pause" } else { "resume" })
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    /// Returns true when a job record was removed.
    pub async fn remove_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        job_id: &str,
    ) -> GantryResult<bool> {
        let k = &self.keys;
        let reply: Value = self
            .remove_job
            .prepare_invoke()
            .key(&k.wait)
            .key(&k.paused)
            .key(&k.active)
            .key(&k.delayed)
            .key(&k.priority)
            .key(&k.completed)
            .key(&k.failed)
            .key(&k.waiting_children)
            .key(&k.events)
            .key(&k.meta)
            .arg(k.base())
            .arg(job_id)
            .invoke_async(conn)
            .await?;
        let items = match reply {
            Value::Array(items) => items,
            other => return Err(GantryError::Script(format!("{:?}", other))),
        };
        let tag: String = bulk_item(&items, 0, "remove tag")?;
        match tag.as_str() {
            "ok" => Ok(true),
            "missing" => Ok(false),
            "locked" => Err(GantryError::conflict(format!(
                "Job {} is locked by a worker",
                job_id
            ))),
            other => Err(GantryError::Script(other.to_owned())),
        }
    }

    pub async fn clean<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        container_key: &str,
        kind: &str,
        bound_ts: u64,
        limit: u64,
    ) -> GantryResult<Vec<String>> {
        let k = &self.keys;
        let removed: Vec<String> = self
            .clean
            .prepare_invoke()
            .key(container_key)
            .key(&k.events)
            .key(&k.priority)
            .arg(k.base())
            .arg(kind)
            .arg(bound_ts)
            .arg(limit)
            .invoke_async(conn)
            .await?;
        Ok(removed)
    }

    pub async fn drain<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        include_delayed: bool,
    ) -> GantryResult<u64> {
        let k = &self.keys;
        let dropped: u64 = self
            .drain
            .prepare_invoke()
            .key(&k.wait)
            .key(&k.paused)
            .key(&k.priority)
            .key(&k.delayed)
            .key(&k.events)
            .arg(k.base())
            .arg(if include_delayed { "1" } else { "0" })
            .invoke_async(conn)
            .await?;
        Ok(dropped)
    }

    /// Delete every key in the queue's namespace. Refuses while jobs are active
    /// unless `force` is set.
    pub async fn obliterate<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        force: bool,
    ) -> GantryResult<u64> {
        let k = &self.keys;
        let removed: i64 = self
            .obliterate
            .prepare_invoke()
            .key(&k.active)
            .arg(k.namespace_pattern())
            .arg(if force { "1" } else { "0" })
            .invoke_async(conn)
            .await?;
        if removed < 0 {
            return Err(GantryError::conflict(
                "Cannot obliterate queue with active jobs",
            ));
        }
        Ok(removed as u64)
    }
}
