use std::{
    collections::HashMap,
    time::Duration,
};

use async_trait::async_trait;
use redis::{
    Script,
    aio::ConnectionManager,
};
use uuid::Uuid;

use crate::store::{
    CounterOp,
    CounterStore,
    Expiry,
    OpOutcome,
    StoreError,
    StoreResult,
};

// Shared argument layout for the operation scripts:
//   ARGV[1] now_ms, ARGV[2] commit (1/0), ARGV[3] ttl_ms, ARGV[4] refresh ttl (1/0)
// Every script returns {admitted, level (string), oldest_ms or -1, pttl}.

const TAKE_TOKENS_LUA: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local commit = ARGV[2] == '1'
local ttl_ms = tonumber(ARGV[3])
local capacity = tonumber(ARGV[5])
local refill_per_ms = tonumber(ARGV[6])
local requested = tonumber(ARGV[7])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])

if tokens == nil or ts == nil then
  tokens = capacity
  ts = now_ms
end

local elapsed = math.max(0, now_ms - ts)
tokens = math.max(0, math.min(capacity, tokens + elapsed * refill_per_ms))

local admitted = 0
if tokens >= requested then
  admitted = 1
  tokens = tokens - requested
  if commit then
    redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(math.max(now_ms, ts)))
    redis.call('PEXPIRE', key, ttl_ms)
  end
end

return {admitted, tostring(tokens), -1, redis.call('PTTL', key)}
"#;

const APPEND_LOG_LUA: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local commit = ARGV[2] == '1'
local ttl_ms = tonumber(ARGV[3])
local window_ms = tonumber(ARGV[5])
local max_entries = tonumber(ARGV[6])
local count = tonumber(ARGV[7])
local member = ARGV[8]

local floor = now_ms - window_ms
local live = redis.call('ZCOUNT', key, floor, '+inf')

local admitted = 0
if live + count <= max_entries then
  admitted = 1
  if commit and count > 0 then
    redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. floor)
    for i = 1, count do
      redis.call('ZADD', key, now_ms, member .. ':' .. i)
    end
    redis.call('PEXPIRE', key, ttl_ms)
  end
  live = live + count
end

local oldest = -1
local first = redis.call('ZRANGEBYSCORE', key, floor, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
if first[2] then
  oldest = tonumber(first[2])
end
if admitted == 1 and count > 0 and (oldest < 0 or now_ms < oldest) then
  oldest = now_ms
end

return {admitted, tostring(live), oldest, redis.call('PTTL', key)}
"#;

const BOUNDED_INCREMENT_LUA: &str = r#"
local key = KEYS[1]
local commit = ARGV[2] == '1'
local ttl_ms = tonumber(ARGV[3])
local refresh = ARGV[4] == '1'
local limit = tonumber(ARGV[5])
local amount = tonumber(ARGV[6])

local current = tonumber(redis.call('GET', key) or '0') or 0

local admitted = 0
if current + amount <= limit then
  admitted = 1
  current = current + amount
  if commit and amount > 0 then
    redis.call('INCRBY', key, amount)
    if refresh or redis.call('PTTL', key) < 0 then
      redis.call('PEXPIRE', key, ttl_ms)
    end
  end
end

return {admitted, tostring(current), -1, redis.call('PTTL', key)}
"#;

const RELEASE_LUA: &str = r#"
local key = KEYS[1]
local commit = ARGV[2] == '1'
local amount = tonumber(ARGV[5])

local current = tonumber(redis.call('GET', key) or '0') or 0
local released = math.min(current, amount)
if commit and released > 0 then
  redis.call('DECRBY', key, released)
end

return {1, tostring(current - released), -1, redis.call('PTTL', key)}
"#;

const REMOVE_ENTRIES_LUA: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local commit = ARGV[2] == '1'
local window_ms = tonumber(ARGV[5])
local at_ms = tonumber(ARGV[6])
local count = tonumber(ARGV[7])

local floor = now_ms - window_ms
local stamped = redis.call('ZRANGEBYSCORE', key, at_ms, at_ms, 'LIMIT', 0, count)
local live = redis.call('ZCOUNT', key, floor, '+inf')
if #stamped > 0 then
  if commit then
    redis.call('ZREM', key, unpack(stamped))
  end
  if at_ms >= floor then
    live = live - #stamped
  end
end

local oldest = -1
if commit then
  local first = redis.call('ZRANGEBYSCORE', key, floor, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
  if first[2] then
    oldest = tonumber(first[2])
  end
end

return {1, tostring(live), oldest, redis.call('PTTL', key)}
"#;

type ScriptReply = (i64, String, i64, i64);

pub struct RedisCounterStore {
    manager: ConnectionManager,
    take_tokens: Script,
    append_log: Script,
    bounded_increment: Script,
    release: Script,
    remove_entries: Script,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            take_tokens: Script::new(TAKE_TOKENS_LUA),
            append_log: Script::new(APPEND_LOG_LUA),
            bounded_increment: Script::new(BOUNDED_INCREMENT_LUA),
            release: Script::new(RELEASE_LUA),
            remove_entries: Script::new(REMOVE_ENTRIES_LUA),
        })
    }

    async fn run(
        &self,
        key: &str,
        op: &CounterOp,
        now_ms: u64,
        commit: bool,
        expiry: Expiry,
    ) -> StoreResult<OpOutcome> {
        let mut conn = self.manager.clone();
        let script = match op {
            CounterOp::TakeTokens { .. } => &self.take_tokens,
            CounterOp::AppendLog { .. } => &self.append_log,
            CounterOp::BoundedIncrement { .. } => &self.bounded_increment,
            CounterOp::Release { .. } => &self.release,
            CounterOp::RemoveEntries { .. } => &self.remove_entries,
        };

        let mut invocation = script.prepare_invoke();
        invocation
            .key(key)
            .arg(now_ms)
            .arg(if commit { 1 } else { 0 })
            .arg(expiry.ttl().as_millis().max(1) as u64)
            .arg(if expiry.refreshes() { 1 } else { 0 });

        match op {
            CounterOp::TakeTokens {
                capacity,
                refill_per_ms,
                requested,
            } => {
                invocation.arg(*capacity).arg(*refill_per_ms).arg(*requested);
            }
            CounterOp::AppendLog {
                window_ms,
                max_entries,
                count,
            } => {
                let member = format!("{}-{}", now_ms, Uuid::new_v4());
                invocation
                    .arg(*window_ms)
                    .arg(*max_entries)
                    .arg(*count)
                    .arg(member);
            }
            CounterOp::BoundedIncrement { limit, amount } => {
                invocation.arg(*limit).arg(*amount);
            }
            CounterOp::Release { amount } => {
                invocation.arg(*amount);
            }
            CounterOp::RemoveEntries {
                window_ms,
                at_ms,
                count,
            } => {
                invocation.arg(*window_ms).arg(*at_ms).arg(*count);
            }
        }

        let (admitted, level, oldest_ms, pttl): ScriptReply =
            invocation.invoke_async(&mut conn).await?;

        let level = level
            .parse::<f64>()
            .map_err(|e| StoreError::Protocol(format!("level {level:?}: {e}")))?;

        Ok(OpOutcome {
            admitted: admitted == 1,
            level,
            oldest_ms: (oldest_ms >= 0).then_some(oldest_ms as u64),
            expires_at_ms: (pttl > 0).then(|| now_ms + pttl as u64),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn apply(
        &self,
        key: &str,
        op: &CounterOp,
        now_ms: u64,
        expiry: Expiry,
    ) -> StoreResult<OpOutcome> {
        self.run(key, op, now_ms, true, expiry).await
    }

    async fn inspect(&self, key: &str, op: &CounterOp, now_ms: u64) -> StoreResult<OpOutcome> {
        // TTL arguments are ignored when nothing is committed.
        self.run(key, op, now_ms, false, Expiry::Refresh(Duration::from_millis(1)))
            .await
    }

    async fn bump(
        &self,
        key: &str,
        increments: &[(String, u64)],
        _now_ms: u64,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, by) in increments {
            pipe.cmd("HINCRBY").arg(key).arg(field).arg(*by).ignore();
        }
        pipe.cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .ignore();

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn read_fields(&self, key: &str, _now_ms: u64) -> StoreResult<HashMap<String, u64>> {
        let mut conn = self.manager.clone();
        let fields: HashMap<String, u64> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(fields)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let removed: u64 = cmd.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(StoreError::Protocol(format!("unexpected PING reply {reply:?}")));
        }
        Ok(())
    }
}
