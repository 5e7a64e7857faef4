// In-memory doubles for the allocator's cache dependency, the cache layer's
// raw store, and the durable message store — so gateway/ingest/pull-sync
// tests don't need a live Redis or Postgres. Each double implements the
// same trait seam the production Redis/Postgres types implement
// (`im_allocator::SeqCache`, `im_cache::RawStore`,
// `im_store::{SeqStore, MessageStore}`), matching the teacher's own design
// note: "Tests instantiate in-memory doubles."

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use im_allocator::{AllocatorError, SeqCache};
use im_cache::{CacheError, RawStore};
use im_protocol::Message;
use im_store::{ConvReadSeq, MessageStore, SeqStore, StoreError, TimelineEntry};

/// Replicates the `malloc`/`setSeq` Lua state machine in plain Rust.
#[derive(Default)]
pub struct InMemorySeqCache {
    hashes: Mutex<HashMap<String, Hash>>,
}

#[derive(Default, Clone)]
struct Hash {
    curr: i64,
    last: i64,
    lock: Option<i64>,
    exists: bool,
}

impl InMemorySeqCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a conversation's cached window directly, bypassing the
    /// not-found/refill path, for tests that want to start warm.
    pub fn seed(&self, key: &str, curr: i64, last: i64) {
        self.hashes.lock().unwrap().insert(
            key.to_owned(),
            Hash { curr, last, lock: None, exists: true },
        );
    }
}

#[async_trait::async_trait]
impl SeqCache for InMemorySeqCache {
    async fn malloc(
        &self,
        key: &str,
        size: i64,
        _lock_secs: i64,
        _data_secs: i64,
        now_ms: i64,
    ) -> Result<Vec<i64>, AllocatorError> {
        let mut hashes = self.hashes.lock().unwrap();
        let entry = hashes.entry(key.to_owned()).or_default();
        if !entry.exists {
            let lock = 1;
            entry.lock = Some(lock);
            entry.exists = true;
            return Ok(vec![1, lock, now_ms]);
        }
        if let Some(lock) = entry.lock {
            if size == 0 {
                return Ok(vec![0, entry.curr, entry.last]);
            }
            let _ = lock;
            return Ok(vec![2]);
        }
        if size == 0 {
            return Ok(vec![0, entry.curr, entry.last]);
        }
        let max_seq = entry.curr + size;
        if max_seq > entry.last {
            let lock = entry.curr + entry.last + 1;
            let curr = entry.curr;
            let last = entry.last;
            entry.lock = Some(lock);
            entry.curr = last;
            return Ok(vec![3, curr, last, lock]);
        }
        entry.curr = max_seq;
        Ok(vec![0, entry.curr - size, entry.last])
    }

    async fn set_seq(
        &self,
        key: &str,
        owner: i64,
        curr: i64,
        last: i64,
        _data_secs: i64,
        _mall_time: i64,
    ) -> Result<i64, AllocatorError> {
        let mut hashes = self.hashes.lock().unwrap();
        let entry = hashes.entry(key.to_owned()).or_default();
        if !entry.exists {
            entry.exists = true;
            entry.curr = curr;
            entry.last = last;
            return Ok(1);
        }
        if entry.lock != Some(owner) {
            return Ok(2);
        }
        entry.lock = None;
        entry.curr = curr;
        entry.last = last;
        Ok(0)
    }
}

/// In-memory `RawStore`: a plain string map with TTLs ignored (tests don't
/// exercise expiry; they exercise single-flight and negative caching).
#[derive(Default)]
pub struct InMemoryRawStore {
    data: Mutex<HashMap<String, String>>,
}

impl InMemoryRawStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RawStore for InMemoryRawStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let data = self.data.lock().unwrap();
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), CacheError> {
        self.data.lock().unwrap().insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// In-memory durable store double: messages, per-conversation and per-user
/// sequence counters, conversation membership, and the user timeline.
#[derive(Default)]
pub struct InMemoryStore {
    messages: Mutex<HashMap<i64, Message>>,
    conv_seqs: Mutex<HashMap<String, i64>>,
    user_seqs: Mutex<HashMap<String, i64>>,
    conversations: Mutex<HashMap<(String, String), ConvReadSeq>>,
    timelines: Mutex<Vec<TimelineEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Seeds a `(user_id, conversation_id)` membership row with explicit
    /// `min_seq`/`read_seq`/`max_seq` bounds directly, for pull/sync tests
    /// that need a pinned visibility window (a left-group snapshot or a
    /// history-clear watermark) without replaying the join/leave mutations
    /// that would normally produce it.
    pub fn seed_conversation(&self, user_id: &str, conversation_id: &str, bounds: ConvReadSeq) {
        self.conversations
            .lock()
            .unwrap()
            .insert((user_id.to_owned(), conversation_id.to_owned()), bounds);
    }
}

#[async_trait::async_trait]
impl SeqStore for InMemoryStore {
    async fn refill_conversation_seq(&self, conversation_id: &str, refill: i64) -> Result<i64, StoreError> {
        let mut seqs = self.conv_seqs.lock().unwrap();
        let prev = *seqs.get(conversation_id).unwrap_or(&0);
        seqs.insert(conversation_id.to_owned(), prev + refill);
        Ok(prev)
    }

    async fn refill_user_seq(&self, user_id: &str, refill: i64) -> Result<i64, StoreError> {
        let mut seqs = self.user_seqs.lock().unwrap();
        let prev = *seqs.get(user_id).unwrap_or(&0);
        seqs.insert(user_id.to_owned(), prev + refill);
        Ok(prev)
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryStore {
    async fn upsert_messages(&self, messages: &[Message]) -> Result<(), StoreError> {
        let mut store = self.messages.lock().unwrap();
        for msg in messages {
            store.insert(msg.id, msg.clone());
        }
        Ok(())
    }

    async fn fetch_messages_by_seq_list(&self, conversation_id: &str, seqs: &[i64]) -> Result<Vec<Message>, StoreError> {
        let store = self.messages.lock().unwrap();
        let mut out: Vec<Message> = store
            .values()
            .filter(|m| m.conversation_id == conversation_id && seqs.contains(&m.seq))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.seq);
        Ok(out)
    }

    async fn fetch_messages_in_range(
        &self,
        conversation_id: &str,
        begin_seq: i64,
        end_seq: i64,
        limit: i64,
        descending: bool,
    ) -> Result<Vec<Message>, StoreError> {
        let store = self.messages.lock().unwrap();
        let mut out: Vec<Message> = store
            .values()
            .filter(|m| m.conversation_id == conversation_id && m.seq >= begin_seq && m.seq <= end_seq)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.seq);
        if descending {
            out.reverse();
        }
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn upsert_conversation(&self, user_id: &str, conversation_id: &str) -> Result<(), StoreError> {
        self.conversations
            .lock()
            .unwrap()
            .entry((user_id.to_owned(), conversation_id.to_owned()))
            .or_insert(ConvReadSeq { min_seq: 0, read_seq: 0, max_seq: 0 });
        Ok(())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .keys()
            .filter(|(uid, _)| uid == user_id)
            .map(|(_, cid)| cid.clone())
            .collect())
    }

    async fn set_conversation_read_seq(
        &self,
        user_id: &str,
        conversation_id: &str,
        read_seq: i64,
        max_seq: i64,
    ) -> Result<(), StoreError> {
        let mut convs = self.conversations.lock().unwrap();
        let min_seq = convs
            .get(&(user_id.to_owned(), conversation_id.to_owned()))
            .map(|v| v.min_seq)
            .unwrap_or(0);
        convs.insert(
            (user_id.to_owned(), conversation_id.to_owned()),
            ConvReadSeq { min_seq, read_seq, max_seq },
        );
        Ok(())
    }

    async fn get_conv_read_max_seq(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> Result<HashMap<String, ConvReadSeq>, StoreError> {
        let convs = self.conversations.lock().unwrap();
        Ok(conversation_ids
            .iter()
            .filter_map(|cid| convs.get(&(user_id.to_owned(), cid.clone())).map(|v| (cid.clone(), *v)))
            .collect())
    }

    async fn insert_timeline_entry(&self, entry: &TimelineEntry) -> Result<(), StoreError> {
        self.timelines.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn fetch_timeline(&self, owner_id: &str, from_seq: i64) -> Result<Vec<TimelineEntry>, StoreError> {
        let mut out: Vec<TimelineEntry> = self
            .timelines
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.owner_id == owner_id && e.seq >= from_seq)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }
}
