// im-cache: Redis-backed read-through cache with single-flight de-duplication
// and short-lived negative caching for misses.
//
// The raw key/value operations are behind the `RawStore` trait so the
// single-flight and negative-cache bookkeeping can be unit tested without a
// live Redis instance; `RedisStore` is the production implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache value was not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    /// A loader's own backing call (the durable store, an upstream service)
    /// failed. Loaders report their error through this variant rather than
    /// `Cache` depending on every possible upstream error type.
    #[error("cache loader failed: {0}")]
    Loader(String),
}

/// Sentinel value stored in place of a loaded value to remember a recent
/// miss, so a hot key that genuinely doesn't exist doesn't hammer the loader.
const NEGATIVE_SENTINEL: &str = "\0NF\0";

/// How long a negative cache entry lives, per spec.md §4.B's "short TTL (1
/// minute)" for absorbing negative-lookup storms.
const NEGATIVE_TTL: Duration = Duration::from_secs(60);

#[async_trait::async_trait]
pub trait RawStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}

/// `RawStore` backed by a live Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl RawStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Read-through cache. Concurrent loads for the same key are coalesced: only
/// the first caller runs the loader, the rest wait on a `Notify` and then
/// re-read the freshly populated (or negatively-cached) entry.
pub struct Cache<S: RawStore> {
    store: S,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl<S: RawStore> Cache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Reads `key`, loading it with `loader` on a miss. `loader` returning
    /// `Ok(None)` caches a short-lived negative entry.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, CacheError>>,
    {
        if let Some(hit) = self.read_one(key).await? {
            return Ok(hit);
        }

        loop {
            let leader_notify = {
                let mut inflight = self.inflight.lock().unwrap();
                if inflight.contains_key(key) {
                    None
                } else {
                    let notify = Arc::new(Notify::new());
                    inflight.insert(key.to_owned(), notify);
                    Some(())
                }
            };

            if leader_notify.is_some() {
                let result = loader().await;
                let notify = {
                    let mut inflight = self.inflight.lock().unwrap();
                    inflight.remove(key)
                };
                let result = result?;
                match &result {
                    Some(value) => {
                        let encoded = serde_json::to_string(value)?;
                        self.store.set_ex(key, &encoded, jittered_ttl(ttl)).await?;
                    }
                    None => self.set_negative(key).await?,
                }
                if let Some(notify) = notify {
                    notify.notify_waiters();
                }
                return Ok(result);
            }

            let waiter = {
                let inflight = self.inflight.lock().unwrap();
                inflight.get(key).cloned()
            };
            match waiter {
                Some(notify) => {
                    notify.notified().await;
                    if let Some(hit) = self.read_one(key).await? {
                        return Ok(hit);
                    }
                    // Leader's write raced with our read, or lost the race
                    // to become leader ourselves; retry.
                }
                None => continue,
            }
        }
    }

    /// Batch read-through: resolves as many `keys` as possible from the
    /// store in a single round trip, then loads the remainder in one call to
    /// `loader` and populates the cache for next time.
    pub async fn batch_get_or_load<T, F, Fut>(
        &self,
        keys: &[String],
        ttl: Duration,
        loader: F,
    ) -> Result<HashMap<String, T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, T>, CacheError>>,
    {
        let mut out = HashMap::new();
        if keys.is_empty() {
            return Ok(out);
        }

        let raws = self.store.mget(keys).await?;
        let mut missing = Vec::new();
        for (key, raw) in keys.iter().zip(raws) {
            match raw {
                Some(v) if v == NEGATIVE_SENTINEL => {}
                Some(v) => {
                    out.insert(key.clone(), serde_json::from_str(&v)?);
                }
                None => missing.push(key.clone()),
            }
        }

        if missing.is_empty() {
            return Ok(out);
        }

        debug!(missing = missing.len(), total = keys.len(), "batch cache miss");
        let loaded = loader(missing.clone()).await?;
        for key in &missing {
            match loaded.get(key) {
                Some(value) => {
                    let encoded = serde_json::to_string(value)?;
                    self.store.set_ex(key, &encoded, jittered_ttl(ttl)).await?;
                    out.insert(key.clone(), value.clone());
                }
                None => self.set_negative(key).await?,
            }
        }
        Ok(out)
    }

    /// Blind write: populates `key` without consulting or coalescing against
    /// any in-flight loader. Used by callers that already computed the
    /// authoritative value themselves (the ingest pipeline, writing a
    /// freshly-sequenced message) rather than deriving it from a miss.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(value)?;
        self.store.set_ex(key, &encoded, ttl).await
    }

    async fn read_one<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Option<T>>, CacheError> {
        match self.store.get(key).await? {
            Some(v) if v == NEGATIVE_SENTINEL => Ok(Some(None)),
            Some(v) => Ok(Some(Some(serde_json::from_str(&v)?))),
            None => Ok(None),
        }
    }

    async fn set_negative(&self, key: &str) -> Result<(), CacheError> {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..5_000));
        self.store
            .set_ex(key, NEGATIVE_SENTINEL, NEGATIVE_TTL + jitter)
            .await
    }
}

/// Subtracts up to 10% jitter from `ttl`, per spec.md §4.B, so that a batch
/// of keys cached at the same instant don't all expire together and stampede
/// the loader at once.
fn jittered_ttl(ttl: Duration) -> Duration {
    let max_jitter_millis = ttl.as_millis() as u64 / 10;
    if max_jitter_millis == 0 {
        return ttl;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter_millis);
    ttl.saturating_sub(Duration::from_millis(jitter))
}

pub mod keys {
    /// Key for a single message, addressed by conversation and seq, matching
    /// the 24h hot-path cache window used by the ingest pipeline.
    pub fn message(conversation_id: &str, seq: i64) -> String {
        format!("MSG_CACHE:{conversation_id}:{seq}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct InMemoryStore {
        data: Mutex<HashMap<String, (String, Duration)>>,
    }

    #[async_trait::async_trait]
    impl RawStore for InMemoryStore {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            Ok(self.data.lock().unwrap().get(key).map(|(v, _)| v.clone()))
        }

        async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
            let data = self.data.lock().unwrap();
            Ok(keys.iter().map(|k| data.get(k).map(|(v, _)| v.clone())).collect())
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
            self.data
                .lock()
                .unwrap()
                .insert(key.to_owned(), (value.to_owned(), ttl));
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
    struct Widget {
        name: String,
    }

    #[tokio::test]
    async fn get_or_load_calls_loader_once_per_key() {
        let cache = Cache::new(InMemoryStore::default());
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_load("widget:1", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Widget { name: "a".to_owned() }))
            })
            .await
            .unwrap();
        assert_eq!(first, Some(Widget { name: "a".to_owned() }));

        let second = cache
            .get_or_load("widget:1", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Widget { name: "b".to_owned() }))
            })
            .await
            .unwrap();
        // Second call hits the cache, loader for "b" never runs.
        assert_eq!(second, Some(Widget { name: "a".to_owned() }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_load_caches_misses_as_negative() {
        let cache: Cache<InMemoryStore> = Cache::new(InMemoryStore::default());
        let calls = AtomicUsize::new(0);

        let miss = cache
            .get_or_load::<Widget, _, _>("widget:missing", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert!(miss.is_none());

        let miss_again = cache
            .get_or_load::<Widget, _, _>("widget:missing", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Widget { name: "late".to_owned() }))
            })
            .await
            .unwrap();
        assert!(miss_again.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_get_or_load_only_fetches_missing_keys() {
        let cache = Cache::new(InMemoryStore::default());
        cache
            .get_or_load("widget:1", Duration::from_secs(60), || async {
                Ok(Some(Widget { name: "a".to_owned() }))
            })
            .await
            .unwrap();

        let keys = vec!["widget:1".to_owned(), "widget:2".to_owned()];
        let loaded_keys = Mutex::new(Vec::new());
        let result = cache
            .batch_get_or_load(&keys, Duration::from_secs(60), |missing| async {
                *loaded_keys.lock().unwrap() = missing.clone();
                let mut out = HashMap::new();
                out.insert("widget:2".to_owned(), Widget { name: "b".to_owned() });
                Ok(out)
            })
            .await
            .unwrap();

        assert_eq!(loaded_keys.into_inner().unwrap(), vec!["widget:2".to_owned()]);
        assert_eq!(result.get("widget:1").unwrap().name, "a");
        assert_eq!(result.get("widget:2").unwrap().name, "b");
    }

    #[test]
    fn message_key_includes_conversation_and_seq() {
        assert_eq!(keys::message("conv-1", 42), "MSG_CACHE:conv-1:42");
    }

    #[tokio::test]
    async fn put_writes_without_consulting_a_loader() {
        let cache = Cache::new(InMemoryStore::default());
        cache
            .put("widget:1", &Widget { name: "a".to_owned() }, Duration::from_secs(60))
            .await
            .unwrap();

        let read = cache
            .get_or_load::<Widget, _, _>("widget:1", Duration::from_secs(60), || async {
                panic!("loader must not run on a populated key")
            })
            .await
            .unwrap();
        assert_eq!(read, Some(Widget { name: "a".to_owned() }));
    }
}
