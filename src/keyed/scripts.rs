//! Server-side procedures for the Redis keyed store.
//!
//! Each script runs atomically on the server. Keys that depend on stored
//! data (object and query keys) are built inside the script from prefixes
//! passed in ARGV, so the store must not be a cluster.
//!
//! An object key holding the empty string is a tombstone: the document was
//! deleted recently. Readers treat it as missing and write-back (`SET ... NX`)
//! cannot replace it.

/// KEYS[1] query key
/// ARGV[1] object key prefix
///
/// Returns nil on a miss, otherwise `{entry_json, {id, json, ...}, {missing_id, ...}}`.
pub const GET: &str = r#"
local entry = redis.call('GET', KEYS[1])
if not entry then
  return false
end
local ok, decoded = pcall(cjson.decode, entry)
if not ok or type(decoded) ~= 'table' or type(decoded['ids']) ~= 'table' then
  return false
end
local hits = {}
local missing = {}
for _, id in ipairs(decoded['ids']) do
  local object = redis.call('GET', ARGV[1] .. id)
  if object and object ~= '' then
    table.insert(hits, id)
    table.insert(hits, object)
  else
    table.insert(missing, id)
  end
end
return {entry, hits, missing}
"#;

/// KEYS[1] query key, KEYS[2] group key
/// ARGV[1] object key prefix, ARGV[2] object ttl, ARGV[3] query ttl,
/// ARGV[4] 'establish' or 'refill', ARGV[5] entry json, ARGV[6] fingerprint,
/// ARGV[7] '1' to tag the group, ARGV[8..] id/json pairs
///
/// Objects already present (or tombstoned) are left alone.
/// Returns the number of objects written.
pub const SET: &str = r#"
local written = 0
for i = 8, #ARGV, 2 do
  if redis.call('SET', ARGV[1] .. ARGV[i], ARGV[i + 1], 'NX', 'EX', ARGV[2]) then
    written = written + 1
  end
end
local tag = ARGV[7] == '1'
if ARGV[4] == 'establish' then
  redis.call('SET', KEYS[1], ARGV[5], 'EX', ARGV[3])
elseif redis.call('EXISTS', KEYS[1]) == 0 then
  tag = false
end
if tag then
  redis.call('SADD', KEYS[2], ARGV[6])
  redis.call('EXPIRE', KEYS[2], ARGV[3])
end
return written
"#;

/// KEYS[1] marker key, KEYS[2] object key, KEYS[3] group key
/// ARGV[1] marker ttl, ARGV[2] object ttl, ARGV[3] document json or '',
/// ARGV[4] '1' to drop the group, ARGV[5] query key prefix,
/// ARGV[6] '1' to check the marker
///
/// Returns the number of entries affected, 0 for a replayed event.
pub const INVALIDATE: &str = r#"
if ARGV[6] == '1' then
  if not redis.call('SET', KEYS[1], '1', 'NX', 'EX', ARGV[1]) then
    return 0
  end
end
local affected = 0
if ARGV[3] ~= '' then
  redis.call('SET', KEYS[2], ARGV[3], 'EX', ARGV[2])
  affected = 1
else
  local previous = redis.call('GET', KEYS[2])
  if previous and previous ~= '' then
    affected = 1
  end
  redis.call('SET', KEYS[2], '', 'EX', ARGV[1])
end
if ARGV[4] == '1' then
  for _, fingerprint in ipairs(redis.call('SMEMBERS', KEYS[3])) do
    affected = affected + redis.call('DEL', ARGV[5] .. fingerprint)
  end
  redis.call('DEL', KEYS[3])
end
return affected
"#;

/// KEYS[1] group key
/// ARGV[1] query key prefix
///
/// Returns the number of query entries dropped.
pub const INVALIDATE_GROUP: &str = r#"
local affected = 0
for _, fingerprint in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  affected = affected + redis.call('DEL', ARGV[1] .. fingerprint)
end
redis.call('DEL', KEYS[1])
return affected
"#;
