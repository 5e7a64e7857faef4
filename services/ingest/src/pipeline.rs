// Ingest Pipeline worker, per spec.md §4.E: the batch processor accumulates
// `SendMsgReq`s keyed by conversation; once a bucket flushes, the worker
// allocates a contiguous seq range for the whole bucket in one allocator
// call, tags each message with a freshly generated id, writes the batch into
// the cache, durably persists it in the background, materializes timeline
// entries, and publishes each message individually to the `push` topic.
// Grounded on `distributor.go`'s `batchprocessor.Do` worker function and
// `im_repo.go`'s `BatchStoreMsgToRedis`/`BatchStoreMsgToDB` split.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use im_allocator::{Allocator, SeqCache};
use im_batch::{BatchConfig, BatchProcessor, KeyFn, WorkerFn};
use im_cache::{Cache, RawStore};
use im_protocol::{conversation, ConvType, Message, SendMsgReq};
use im_queue::{Handler, Producer, QueueError, Record, PUSH_TOPIC};
use im_store::{IdGenerator, MessageStore, SeqStore};
use tracing::{error, warn};

use crate::metrics::Metrics;
use crate::timeline::TimelinePolicy;

pub fn conversation_id_for(req: &SendMsgReq) -> String {
    match req.conv_type {
        ConvType::Single => conversation::single(&req.sender_id, &req.target_id),
        ConvType::Group => conversation::group(&req.target_id),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Owns the running batch processor. `close()` drains it on shutdown; the
/// struct itself carries no type parameters because `spawn`'s generics are
/// only needed to build the worker closure, matching `im_batch::BatchProcessor`'s
/// own shape.
pub struct IngestPipeline {
    batch: BatchProcessor<SendMsgReq>,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<Csq, Rs, St, P>(
        config: BatchConfig,
        allocator: Arc<Allocator<Csq, St>>,
        cache: Arc<Cache<Rs>>,
        store: Arc<St>,
        producer: Arc<P>,
        id_gen: Arc<IdGenerator>,
        timeline_policy: Arc<dyn TimelinePolicy<St>>,
        metrics: Arc<Metrics>,
    ) -> Self
    where
        Csq: SeqCache + 'static,
        Rs: RawStore + 'static,
        St: MessageStore + SeqStore + 'static,
        P: Producer<Message> + 'static,
    {
        let key_fn: KeyFn<SendMsgReq> = Arc::new(|req: &SendMsgReq| conversation_id_for(req));
        let worker_fn: WorkerFn<SendMsgReq> = Arc::new(move |worker_id, items| {
            let allocator = allocator.clone();
            let cache = cache.clone();
            let store = store.clone();
            let producer = producer.clone();
            let id_gen = id_gen.clone();
            let timeline_policy = timeline_policy.clone();
            let metrics = metrics.clone();
            Box::pin(async move {
                process_bucket(
                    worker_id,
                    items,
                    allocator.as_ref(),
                    cache.as_ref(),
                    &store,
                    producer.as_ref(),
                    id_gen.as_ref(),
                    timeline_policy.as_ref(),
                    metrics.as_ref(),
                )
                .await;
            })
        });
        let batch = BatchProcessor::spawn(config, Some(key_fn), worker_fn);
        Self { batch }
    }

    /// Hands one inbound send request to the batcher. Returns `false` if the
    /// batcher has been closed or its input channel is full.
    pub fn enqueue(&self, req: SendMsgReq) -> bool {
        self.batch.enqueue(req)
    }

    pub async fn close(self) {
        self.batch.close().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_bucket<Csq, Rs, St>(
    worker_id: usize,
    items: Vec<SendMsgReq>,
    allocator: &Allocator<Csq, St>,
    cache: &Cache<Rs>,
    store: &Arc<St>,
    producer: &dyn Producer<Message>,
    id_gen: &IdGenerator,
    timeline_policy: &dyn TimelinePolicy<St>,
    metrics: &Metrics,
) where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore + Send + Sync + 'static,
{
    let Some(first) = items.first() else { return };
    let conversation_id = conversation_id_for(first);
    let n = items.len() as i64;

    let (first_seq, last_seq) = match allocator.allocate(&conversation_id, n).await {
        Ok(range) => range,
        Err(err) => {
            error!(worker_id, conversation_id = %conversation_id, %err, "allocator failed for ingest bucket");
            metrics.record_failure(items.len());
            return;
        }
    };
    // `allocate` returns the pre-increment store value plus 1 as the first
    // assignable seq; a brand-new conversation's counter row starts at 0, so
    // seeing `first_seq == 1` means this bucket created it.
    let is_new_conversation = first_seq == 1;
    let now = now_ms();

    let messages: Vec<Message> = items
        .into_iter()
        .enumerate()
        .map(|(offset, req)| Message {
            id: id_gen.generate(),
            conversation_id: conversation_id.clone(),
            seq: first_seq + offset as i64,
            sender_id: req.sender_id,
            target_id: req.target_id,
            conv_type: req.conv_type,
            msg_type: req.msg_type,
            content: req.content,
            send_time: now,
            create_time: now,
        })
        .collect();
    debug_assert_eq!(messages.last().map(|m| m.seq), Some(last_seq));

    for message in &messages {
        let key = im_cache::keys::message(&message.conversation_id, message.seq);
        if let Err(err) = cache.put(&key, message, Duration::from_secs(24 * 3600)).await {
            warn!(worker_id, conversation_id = %conversation_id, seq = message.seq, %err, "failed writing message to cache");
        }
    }

    if is_new_conversation {
        if let Some(single) = messages.first().filter(|m| m.conv_type == ConvType::Single) {
            if let Err(err) = store.upsert_conversation(&single.sender_id, &conversation_id).await {
                warn!(conversation_id = %conversation_id, %err, "failed creating sender's conversation row");
            }
            if let Err(err) = store.upsert_conversation(&single.target_id, &conversation_id).await {
                warn!(conversation_id = %conversation_id, %err, "failed creating recipient's conversation row");
            }
        }
        // Group conversation creation is the group service's job; the store
        // row is created lazily the first time a member pulls, per
        // spec.md §9's framing of group fan-in as deferred policy.
    }

    for message in &messages {
        timeline_policy.materialize(store.as_ref(), message).await;
    }

    // Durable persistence is fire-and-forget: the cache write plus allocator
    // advance above are already the in-flight record of truth, and a failed
    // write here is caught up by the next redelivery of this conversation's
    // messages (the store is idempotent on `id`), per spec.md §4.E step 4.
    let messages_for_db = messages.clone();
    let store_for_db = store.clone();
    let conversation_id_for_log = conversation_id.clone();
    tokio::spawn(async move {
        if let Err(err) = store_for_db.upsert_messages(&messages_for_db).await {
            error!(conversation_id = %conversation_id_for_log, %err, "failed persisting message batch");
        }
    });

    let mut publish_failures = 0usize;
    for message in &messages {
        if let Err(err) = producer.send(PUSH_TOPIC, &message.conversation_id, message).await {
            error!(conversation_id = %message.conversation_id, seq = message.seq, %err, "failed publishing to push topic");
            publish_failures += 1;
        }
    }

    metrics.record_success(messages.len().saturating_sub(publish_failures));
    metrics.record_failure(publish_failures);
}

/// Bridges the `ingest` topic's consumer group to the batch processor:
/// enqueues the decoded request and returns immediately rather than waiting
/// for the bucket it lands in to flush, so many quick `handle` calls can
/// accumulate into one batch the way spec.md §4.D's batcher expects. The
/// Kafka offset therefore commits once the request is handed off, not once
/// it's durable — consistent with how the fan-out pusher already treats
/// commit as best-effort rather than a strict processing barrier; at-least-once
/// redelivery plus the store's idempotent `id` upsert and the client's
/// `client_msg_id` absorb the gap.
pub struct IngestHandler {
    pipeline: Arc<IngestPipeline>,
}

impl IngestHandler {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl Handler<SendMsgReq> for IngestHandler {
    async fn handle(&self, record: Record<SendMsgReq>) -> Result<(), QueueError> {
        if self.pipeline.enqueue(record.value) {
            Ok(())
        } else {
            Err(QueueError::Handler(
                "ingest batch processor input channel closed or full".to_owned(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use im_queue::memory::MemoryQueue;
    use im_test_support::{InMemorySeqCache, InMemoryStore};
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::timeline::RecipientTimelinePolicy;

    fn req(sender: &str, target: &str) -> SendMsgReq {
        SendMsgReq {
            sender_id: sender.to_owned(),
            target_id: target.to_owned(),
            conv_type: ConvType::Single,
            msg_type: 100,
            content: serde_json::json!({"text": "hi"}),
            client_msg_id: "c1".to_owned(),
        }
    }

    #[tokio::test]
    async fn flushed_bucket_allocates_contiguous_seqs_and_publishes_to_push() {
        let allocator = Arc::new(Allocator::new(InMemorySeqCache::new(), InMemoryStore::new()));
        let cache = Arc::new(Cache::new(im_test_support::InMemoryRawStore::new()));
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let id_gen = Arc::new(IdGenerator::new(1));
        let metrics = Arc::new(Metrics::default());

        let pipeline = IngestPipeline::spawn(
            BatchConfig { size: 2, duration: Duration::from_secs(5), worker_count: 1, chan_size: 16 },
            allocator,
            cache,
            store.clone(),
            queue.clone(),
            id_gen,
            Arc::new(RecipientTimelinePolicy) as Arc<dyn TimelinePolicy<InMemoryStore>>,
            metrics,
        );

        assert!(pipeline.enqueue(req("1", "2")));
        assert!(pipeline.enqueue(req("1", "2")));
        pipeline.close().await;

        assert_eq!(store.message_count(), 2);
        let timeline = store.fetch_timeline("2", 0).await.unwrap();
        assert_eq!(timeline.len(), 2);
    }

    struct RecordingProducer {
        sent: Mutex<HashMap<String, Vec<i64>>>,
    }

    #[async_trait::async_trait]
    impl Producer<Message> for RecordingProducer {
        async fn send(&self, _topic: &str, key: &str, value: &Message) -> Result<(), QueueError> {
            self.sent.lock().unwrap().entry(key.to_owned()).or_default().push(value.seq);
            Ok(())
        }
    }

    #[tokio::test]
    async fn two_concurrent_senders_same_conversation_get_disjoint_seqs() {
        let allocator = Arc::new(Allocator::new(InMemorySeqCache::new(), InMemoryStore::new()));
        let cache = Arc::new(Cache::new(im_test_support::InMemoryRawStore::new()));
        let store = Arc::new(InMemoryStore::new());
        let producer = Arc::new(RecordingProducer { sent: Mutex::new(HashMap::new()) });
        let id_gen = Arc::new(IdGenerator::new(1));
        let metrics = Arc::new(Metrics::default());

        let pipeline = IngestPipeline::spawn(
            BatchConfig { size: 1024, duration: Duration::from_millis(20), worker_count: 2, chan_size: 64 },
            allocator,
            cache,
            store.clone(),
            producer.clone(),
            id_gen,
            Arc::new(RecipientTimelinePolicy) as Arc<dyn TimelinePolicy<InMemoryStore>>,
            metrics,
        );

        assert!(pipeline.enqueue(req("1", "2")));
        assert!(pipeline.enqueue(req("2", "1")));
        pipeline.close().await;

        let sent = producer.sent.lock().unwrap();
        let conv = conversation::single("1", "2");
        let mut seqs = sent.get(&conv).cloned().unwrap_or_default();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2]);
    }
}
