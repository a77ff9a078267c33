// src/storage/scripts.rs

// Lua bodies for the compound store operations. Redis runs a script as a
// single command, so nothing else touches the keys between the read and
// the write.

/// KEYS[1] bucket hash; ARGV capacity, refill_rate, requested, now_ms, ttl_ms.
/// Returns {allowed, tokens-as-string}.
pub(crate) const TAKE_TOKENS: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = math.max(0, now - last_refill) / 1000
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return { allowed, tostring(tokens) }
"#;

/// KEYS[1] counter; ARGV limit, ttl_ms. Returns {allowed, count}.
pub(crate) const INCREMENT_BELOW: &str = r#"
local limit = tonumber(ARGV[1])
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count < limit then
  count = redis.call('INCR', KEYS[1])
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return { 1, count }
end
return { 0, count }
"#;

/// KEYS oldest..newest bucket counters; ARGV limit, ttl_ms.
/// Returns {allowed, total}.
pub(crate) const INCREMENT_WINDOW: &str = r#"
local limit = tonumber(ARGV[1])
local total = 0
for i = 1, #KEYS do
  total = total + tonumber(redis.call('GET', KEYS[i]) or '0')
end
if total < limit then
  redis.call('INCR', KEYS[#KEYS])
  redis.call('PEXPIRE', KEYS[#KEYS], ARGV[2])
  return { 1, total + 1 }
end
return { 0, total }
"#;

/// KEYS[1] sorted set; ARGV min_score, limit, score, member, ttl_ms.
/// Returns {allowed, count}.
pub(crate) const ADMIT_MEMBER: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < tonumber(ARGV[2]) then
  redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return { allowed, count }
"#;
