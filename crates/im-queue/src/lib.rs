// im-queue: typed producer / consumer-group wrapper around the two topics
// the messaging core moves records through (`ingest`, `push`). Component
// code never touches a raw `rdkafka::Message`; it works with a typed
// `Record<T>` and marks offsets through the `Claim` it's handed.
//
// The `Queue` trait is the seam: `KafkaQueue` is the production
// implementation, `MemoryQueue` (behind `dev-support`-style in-memory
// channels, always compiled so library tests don't need a broker) is used by
// every unit test and by `im-test-support`'s integration doubles.

use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

pub const INGEST_TOPIC: &str = "ingest";
pub const PUSH_TOPIC: &str = "push";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("payload was not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    /// A handler's own downstream processing failed. Carried as a string
    /// rather than a boxed error so `Handler` implementors aren't forced to
    /// funnel every possible downstream error type through this crate.
    #[error("handler processing failed: {0}")]
    Handler(String),
}

/// A decoded record handed to a consumer-group handler, plus the means to
/// acknowledge it once processing has committed downstream effects.
pub struct Record<T> {
    pub value: T,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Producer side: publish typed values to a named topic.
#[async_trait::async_trait]
pub trait Producer<T: Serialize + Send + Sync>: Send + Sync {
    async fn send(&self, topic: &str, key: &str, value: &T) -> Result<(), QueueError>;
}

/// Consumer-group side: a handler processes one decoded record at a time and
/// returns whether to commit its offset. A poison message (JSON that won't
/// decode) is logged and its offset committed unconditionally, per spec:
/// unmarshal failures must not loop the consumer forever.
#[async_trait::async_trait]
pub trait Handler<T: DeserializeOwned + Send>: Send + Sync {
    async fn handle(&self, record: Record<T>) -> Result<(), QueueError>;
}

#[async_trait::async_trait]
pub trait ConsumerGroup<T: DeserializeOwned + Send + Sync + 'static>: Send + Sync {
    /// Runs until `shutdown` fires, dispatching every message on `topic` to
    /// `handler`. Re-joins after a transient error with a short backoff.
    async fn run(
        &self,
        topic: &str,
        handler: std::sync::Arc<dyn Handler<T>>,
        shutdown: tokio_util::sync::CancellationToken,
    );
}

// ---------------------------------------------------------------------------
// rdkafka-backed implementation
// ---------------------------------------------------------------------------

pub struct KafkaProducer<T> {
    inner: rdkafka::producer::FutureProducer,
    _marker: PhantomData<T>,
}

impl<T> KafkaProducer<T> {
    pub fn new(brokers: &str) -> Result<Self, QueueError> {
        use rdkafka::ClientConfig;
        let inner = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { inner, _marker: PhantomData })
    }
}

#[async_trait::async_trait]
impl<T: Serialize + Send + Sync> Producer<T> for KafkaProducer<T> {
    async fn send(&self, topic: &str, key: &str, value: &T) -> Result<(), QueueError> {
        use rdkafka::producer::FutureRecord;
        let payload = serde_json::to_vec(value)?;
        self.inner
            .send(
                FutureRecord::to(topic).key(key).payload(&payload),
                Duration::from_secs(5),
            )
            .await
            .map_err(|(err, _)| err)?;
        Ok(())
    }
}

pub struct KafkaConsumerGroup<T> {
    brokers: String,
    group_id: String,
    _marker: PhantomData<T>,
}

impl<T> KafkaConsumerGroup<T> {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<T: DeserializeOwned + Send + Sync + 'static> ConsumerGroup<T> for KafkaConsumerGroup<T> {
    async fn run(
        &self,
        topic: &str,
        handler: std::sync::Arc<dyn Handler<T>>,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        use rdkafka::consumer::{Consumer, StreamConsumer};
        use rdkafka::ClientConfig;
        use rdkafka::Message as _;

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let consumer: StreamConsumer = match ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", "earliest")
                .create()
            {
                Ok(c) => c,
                Err(err) => {
                    error!(%err, topic, "failed to create consumer, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if let Err(err) = consumer.subscribe(&[topic]) {
                error!(%err, topic, "failed to subscribe, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = consumer.recv() => {
                        let msg = match msg {
                            Ok(m) => m,
                            Err(err) => {
                                warn!(%err, topic, "consumer recv error, rejoining");
                                break;
                            }
                        };
                        let payload = msg.payload().unwrap_or_default();
                        match serde_json::from_slice::<T>(payload) {
                            Ok(value) => {
                                let record = Record {
                                    value,
                                    topic: msg.topic().to_owned(),
                                    partition: msg.partition(),
                                    offset: msg.offset(),
                                };
                                if let Err(err) = handler.handle(record).await {
                                    error!(%err, topic, "handler failed, committing offset anyway");
                                }
                            }
                            Err(err) => {
                                warn!(%err, topic, offset = msg.offset(), "poison message, skipping");
                            }
                        }
                        if let Err(err) = consumer.commit_message(&msg, rdkafka::consumer::CommitMode::Async) {
                            warn!(%err, topic, "commit failed");
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory double, used by unit tests and `im-test-support`
// ---------------------------------------------------------------------------

pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    /// A queue backed by per-topic broadcast channels. Every `ConsumerGroup`
    /// created against the same `MemoryQueue` before a `send` sees that
    /// message, matching at-least-once fan-out to consumer group members
    /// closely enough for tests that don't care about partition ownership.
    pub struct MemoryQueue {
        topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    }

    impl Default for MemoryQueue {
        fn default() -> Self {
            Self { topics: Mutex::new(HashMap::new()) }
        }
    }

    impl MemoryQueue {
        pub fn new() -> Self {
            Self::default()
        }

        fn sender_for(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
            let mut topics = self.topics.lock().unwrap();
            topics
                .entry(topic.to_owned())
                .or_insert_with(|| broadcast::channel(1024).0)
                .clone()
        }

        /// Publishes raw, possibly non-JSON bytes directly onto `topic`.
        /// Exists only so tests can simulate a poison message without going
        /// through the typed `Producer::send` path, which can only ever
        /// serialize a valid `T`.
        #[doc(hidden)]
        pub fn send_raw_bytes(&self, topic: &str, payload: Vec<u8>) {
            let _ = self.sender_for(topic).send(payload);
        }
    }

    #[async_trait::async_trait]
    impl<T: Serialize + Send + Sync> Producer<T> for MemoryQueue {
        async fn send(&self, topic: &str, _key: &str, value: &T) -> Result<(), QueueError> {
            let payload = serde_json::to_vec(value)?;
            // No subscribers yet is fine; the message is simply not observed,
            // matching how a fresh consumer group joining later only sees
            // records produced from then on under `auto.offset.reset=latest`.
            let _ = self.sender_for(topic).send(payload);
            Ok(())
        }
    }

    pub struct MemoryConsumerGroup<T> {
        queue: std::sync::Arc<MemoryQueue>,
        _marker: PhantomData<T>,
    }

    impl<T> MemoryConsumerGroup<T> {
        pub fn new(queue: std::sync::Arc<MemoryQueue>) -> Self {
            Self { queue, _marker: PhantomData }
        }
    }

    #[async_trait::async_trait]
    impl<T: DeserializeOwned + Send + Sync + 'static> ConsumerGroup<T> for MemoryConsumerGroup<T> {
        async fn run(
            &self,
            topic: &str,
            handler: std::sync::Arc<dyn Handler<T>>,
            shutdown: tokio_util::sync::CancellationToken,
        ) {
            let mut rx = self.queue.sender_for(topic).subscribe();
            let mut offset = 0i64;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = rx.recv() => {
                        let payload = match msg {
                            Ok(p) => p,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        };
                        match serde_json::from_slice::<T>(&payload) {
                            Ok(value) => {
                                let record = Record { value, topic: topic.to_owned(), partition: 0, offset };
                                offset += 1;
                                if let Err(err) = handler.handle(record).await {
                                    error!(%err, topic, "handler failed, committing offset anyway");
                                }
                            }
                            Err(err) => warn!(%err, topic, "poison message, skipping"),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Payload {
        n: i32,
    }

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Handler<Payload> for CountingHandler {
        async fn handle(&self, record: Record<Payload>) -> Result<(), QueueError> {
            assert_eq!(record.topic, INGEST_TOPIC);
            self.count.fetch_add(record.value.n as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn memory_queue_delivers_produced_records_to_a_running_consumer() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = MemoryConsumerGroup::<Payload>::new(queue.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let shutdown = tokio_util::sync::CancellationToken::new();

        let handler = Arc::new(CountingHandler { count: count.clone() });
        let shutdown_clone = shutdown.clone();
        let task = tokio::spawn(async move {
            consumer.run(INGEST_TOPIC, handler, shutdown_clone).await;
        });

        // Give the consumer a moment to subscribe before producing.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.send(INGEST_TOPIC, "k", &Payload { n: 2 }).await.unwrap();
        queue.send(INGEST_TOPIC, "k", &Payload { n: 3 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    struct PoisonCountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Handler<Payload> for PoisonCountingHandler {
        async fn handle(&self, _record: Record<Payload>) -> Result<(), QueueError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn poison_message_is_skipped_without_stalling_later_messages() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = MemoryConsumerGroup::<Payload>::new(queue.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let shutdown = tokio_util::sync::CancellationToken::new();

        let handler = Arc::new(PoisonCountingHandler { count: count.clone() });
        let shutdown_clone = shutdown.clone();
        let task = tokio::spawn(async move {
            consumer.run(PUSH_TOPIC, handler, shutdown_clone).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Non-JSON bytes go straight onto the topic to simulate a poison
        // message bypassing the typed `Producer::send` path; it must be
        // skipped without stalling the well-formed message sent right after.
        queue.send_raw_bytes(PUSH_TOPIC, b"not json".to_vec());
        queue.send(PUSH_TOPIC, "k", &Payload { n: 1 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
