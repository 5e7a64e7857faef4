// im-allocator: distributed sequence allocator for conversations.
//
// The critical section is the pair of Lua scripts ported near-verbatim from
// `seq_conversation.go` (`malloc`/`setSeq`), invoked against a Redis hash
// keyed per conversation with fields CURR/LAST/LOCK/TIME. `malloc` peeks or
// extends the cached window; on a cache miss or exhausted window the caller
// refills from the durable store under a row lock and publishes the new
// window back with `setSeq`, which is itself compare-and-set against the
// lock token so a lock that expired mid-refill can't be clobbered by a
// refill that raced ahead of it.

use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use im_protocol::conversation;
use im_store::SeqStore as StoreSeqStore;
use tracing::warn;

const LOCK_SECS: i64 = 3;
const DATA_SECS: i64 = 365 * 24 * 60 * 60;
const MAX_RETRIES: usize = 10;
const RETRY_WAIT: Duration = Duration::from_millis(250);
const SINGLE_BASIC_SIZE: i64 = 50;
const GROUP_BASIC_SIZE: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store error: {0}")]
    Store(#[from] im_store::StoreError),
    #[error("malloc seq waiting for lock timed out for conversation {0}")]
    LockTimeout(String),
    #[error("unknown malloc script state {0} for conversation {1}")]
    UnknownState(i64, String),
    #[error("allocate requires n >= 0, got {0}")]
    InvalidSize(i64),
}

/// Outcome of one invocation of the `malloc` script.
enum MallocState {
    /// Cache satisfied the request without touching the store.
    Success { curr: i64 },
    /// Cache entry didn't exist; caller now holds `lock` and must refill.
    NotFound { lock: i64 },
    /// Someone else is mid-refill; caller should wait and retry.
    Locked,
    /// Cache window exhausted; caller now holds `lock` and must refill.
    Exceeded { curr: i64, last: i64, lock: i64 },
}

fn decode_malloc(raw: &[i64], conversation_id: &str) -> Result<MallocState, AllocatorError> {
    match raw.first().copied() {
        Some(0) => Ok(MallocState::Success { curr: raw[1] }),
        Some(1) => Ok(MallocState::NotFound { lock: raw[1] }),
        Some(2) => Ok(MallocState::Locked),
        Some(3) => Ok(MallocState::Exceeded {
            curr: raw[1],
            last: raw[2],
            lock: raw[3],
        }),
        Some(other) => Err(AllocatorError::UnknownState(other, conversation_id.to_owned())),
        None => Err(AllocatorError::UnknownState(-1, conversation_id.to_owned())),
    }
}

/// Raw cache operations the allocator needs. Split out behind a trait so the
/// retry/refill state machine can be unit tested without a live Redis.
#[async_trait::async_trait]
pub trait SeqCache: Send + Sync {
    async fn malloc(
        &self,
        key: &str,
        size: i64,
        lock_secs: i64,
        data_secs: i64,
        now_ms: i64,
    ) -> Result<Vec<i64>, AllocatorError>;

    async fn set_seq(
        &self,
        key: &str,
        owner: i64,
        curr: i64,
        last: i64,
        data_secs: i64,
        mall_time: i64,
    ) -> Result<i64, AllocatorError>;
}

const MALLOC_SCRIPT: &str = r#"
local key = KEYS[1]
local size = tonumber(ARGV[1])
local lockSecond = ARGV[2]
local dataSecond = ARGV[3]
local mallocTime = ARGV[4]
local result = {}
if redis.call("EXISTS", key) == 0 then
    local lockValue = math.random(0, 999999999)
    redis.call("HSET", key, "LOCK", lockValue)
    redis.call("EXPIRE", key, lockSecond)
    table.insert(result, 1)
    table.insert(result, lockValue)
    table.insert(result, mallocTime)
    return result
end
if redis.call("HEXISTS", key, "LOCK") == 1 then
    table.insert(result, 2)
    return result
end
local curr_seq = tonumber(redis.call("HGET", key, "CURR"))
local last_seq = tonumber(redis.call("HGET", key, "LAST"))
if size == 0 then
    redis.call("EXPIRE", key, dataSecond)
    table.insert(result, 0)
    table.insert(result, curr_seq)
    table.insert(result, last_seq)
    local setTime = redis.call("HGET", key, "TIME")
    if setTime then
        table.insert(result, setTime)
    else
        table.insert(result, 0)
    end
    return result
end
local max_seq = curr_seq + size
if max_seq > last_seq then
    local lockValue = math.random(0, 999999999)
    redis.call("HSET", key, "LOCK", lockValue)
    redis.call("HSET", key, "CURR", last_seq)
    redis.call("HSET", key, "TIME", mallocTime)
    redis.call("EXPIRE", key, lockSecond)
    table.insert(result, 3)
    table.insert(result, curr_seq)
    table.insert(result, last_seq)
    table.insert(result, lockValue)
    table.insert(result, mallocTime)
    return result
end
redis.call("HSET", key, "CURR", max_seq)
redis.call("HSET", key, "TIME", ARGV[4])
redis.call("EXPIRE", key, dataSecond)
table.insert(result, 0)
table.insert(result, curr_seq)
table.insert(result, last_seq)
table.insert(result, mallocTime)
return result
"#;

const SET_SEQ_SCRIPT: &str = r#"
local key = KEYS[1]
local lockValue = ARGV[1]
local dataSecond = ARGV[2]
local curr_seq = tonumber(ARGV[3])
local last_seq = tonumber(ARGV[4])
local mallocTime = ARGV[5]
if redis.call("EXISTS", key) == 0 then
    redis.call("HSET", key, "CURR", curr_seq, "LAST", last_seq, "TIME", mallocTime)
    redis.call("EXPIRE", key, dataSecond)
    return 1
end
if redis.call("HGET", key, "LOCK") ~= lockValue then
    return 2
end
redis.call("HDEL", key, "LOCK")
redis.call("HSET", key, "CURR", curr_seq, "LAST", last_seq, "TIME", mallocTime)
redis.call("EXPIRE", key, dataSecond)
return 0
"#;

fn malloc_script() -> &'static redis::Script {
    static SCRIPT: OnceLock<redis::Script> = OnceLock::new();
    SCRIPT.get_or_init(|| redis::Script::new(MALLOC_SCRIPT))
}

fn set_seq_script() -> &'static redis::Script {
    static SCRIPT: OnceLock<redis::Script> = OnceLock::new();
    SCRIPT.get_or_init(|| redis::Script::new(SET_SEQ_SCRIPT))
}

#[derive(Clone)]
pub struct RedisSeqCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisSeqCache {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl SeqCache for RedisSeqCache {
    async fn malloc(
        &self,
        key: &str,
        size: i64,
        lock_secs: i64,
        data_secs: i64,
        now_ms: i64,
    ) -> Result<Vec<i64>, AllocatorError> {
        let mut conn = self.conn.clone();
        let raw: Vec<i64> = malloc_script()
            .key(key)
            .arg(size)
            .arg(lock_secs)
            .arg(data_secs)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(raw)
    }

    async fn set_seq(
        &self,
        key: &str,
        owner: i64,
        curr: i64,
        last: i64,
        data_secs: i64,
        mall_time: i64,
    ) -> Result<i64, AllocatorError> {
        let mut conn = self.conn.clone();
        let state: i64 = set_seq_script()
            .key(key)
            .arg(owner)
            .arg(data_secs)
            .arg(curr)
            .arg(last)
            .arg(mall_time)
            .invoke_async(&mut conn)
            .await?;
        Ok(state)
    }
}

fn conv_seq_key(conversation_id: &str) -> String {
    format!("ConvSeq_SEQ:{conversation_id}")
}

fn malloc_size(conversation_id: &str, size: i64) -> i64 {
    if size == 0 {
        return 0;
    }
    let basic = if conversation::is_group(conversation_id) {
        GROUP_BASIC_SIZE
    } else {
        SINGLE_BASIC_SIZE
    };
    basic + size
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

pub struct Allocator<C: SeqCache, S: StoreSeqStore> {
    cache: C,
    store: S,
}

impl<C: SeqCache, S: StoreSeqStore> Allocator<C, S> {
    pub fn new(cache: C, store: S) -> Self {
        Self { cache, store }
    }

    /// Allocates `n` fresh sequence numbers for `conversation_id`, returning
    /// the inclusive `[first_seq, last_seq]` range. `n < 0` is invalid input
    /// and is rejected as a value, never a panic; `n == 0` is the legal
    /// read-only probe also reachable via [`Allocator::current_max_seq`],
    /// returning `(current, current)`.
    pub async fn allocate(&self, conversation_id: &str, n: i64) -> Result<(i64, i64), AllocatorError> {
        if n < 0 {
            return Err(AllocatorError::InvalidSize(n));
        }
        if n == 0 {
            let current = self.current_max_seq(conversation_id).await?;
            return Ok((current, current));
        }
        let low = self.malloc_with_retry(conversation_id, n).await?;
        Ok((low + 1, low + n))
    }

    /// Returns the current max seq for `conversation_id` without allocating.
    pub async fn current_max_seq(&self, conversation_id: &str) -> Result<i64, AllocatorError> {
        self.malloc_with_retry(conversation_id, 0).await
    }

    async fn malloc_with_retry(&self, conversation_id: &str, size: i64) -> Result<i64, AllocatorError> {
        let key = conv_seq_key(conversation_id);
        for _ in 0..MAX_RETRIES {
            let raw = self
                .cache
                .malloc(&key, size, LOCK_SECS, DATA_SECS, now_ms())
                .await?;
            match decode_malloc(&raw, conversation_id)? {
                MallocState::Success { curr } => return Ok(curr),
                MallocState::NotFound { lock } => {
                    let refill = malloc_size(conversation_id, size);
                    let db_seq = self.store.refill_conversation_seq(conversation_id, refill).await?;
                    self.publish(&key, lock, db_seq + size, db_seq + refill, conversation_id)
                        .await;
                    return Ok(db_seq);
                }
                MallocState::Locked => {
                    tokio::time::sleep(RETRY_WAIT).await;
                    continue;
                }
                MallocState::Exceeded { curr, last, lock } => {
                    let refill = malloc_size(conversation_id, size);
                    let db_seq = self.store.refill_conversation_seq(conversation_id, refill).await?;
                    if last == db_seq {
                        self.publish(&key, lock, curr + size, db_seq + refill, conversation_id)
                            .await;
                        return Ok(curr);
                    }
                    warn!(
                        conversation_id,
                        curr, last, db_seq, "malloc seq not equal cached last seq, using store value"
                    );
                    self.publish(&key, lock, db_seq + size, db_seq + refill, conversation_id)
                        .await;
                    return Ok(db_seq);
                }
            }
        }
        Err(AllocatorError::LockTimeout(conversation_id.to_owned()))
    }

    /// Publishes the freshly-refilled window back to the cache, retrying a
    /// handful of times; failures here just mean the next caller refills
    /// again, so they're logged rather than propagated.
    async fn publish(&self, key: &str, owner: i64, curr: i64, last: i64, conversation_id: &str) {
        for attempt in 0..MAX_RETRIES {
            match self.cache.set_seq(key, owner, curr, last, DATA_SECS, now_ms()).await {
                Ok(0) => return,
                Ok(state) => {
                    warn!(conversation_id, state, attempt, "set seq cache returned non-ideal state");
                    return;
                }
                Err(err) => {
                    warn!(conversation_id, %err, attempt, "set seq cache failed, retrying");
                    tokio::time::sleep(RETRY_WAIT).await;
                }
            }
        }
        warn!(conversation_id, "set seq cache retrying still failed");
    }
}
