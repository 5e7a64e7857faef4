//! End-to-end WebSocket tests against a real `axum::serve` instance, wired
//! entirely to in-memory doubles (no Redis/Postgres/Kafka). Grounded on the
//! teacher's `tests/forwarder_ingest.rs` (`make_server` + `MockWsClient`
//! shape), but the broker side swaps `rdkafka` for `im_queue::memory`'s
//! `MemoryQueue`/`MemoryConsumerGroup` so the fan-out Pusher still runs
//! as a real consumer-group task, just against an in-process topic.

use std::sync::Arc;
use std::time::Duration;

use gateway::auth::PassThroughVerifier;
use gateway::group::EmptyGroupDirectory;
use gateway::kick::{KickPolicy, NoKickPolicy, SinglePlatformSessionPolicy};
use gateway::state::AppState;
use gateway::{build_router, pusher};
use im_allocator::Allocator;
use im_protocol::{codes, req_identifier, ConvType, Message, SendMsgReq, SendMsgResp};
use im_queue::memory::{MemoryConsumerGroup, MemoryQueue};
use im_queue::{ConsumerGroup, Producer, PUSH_TOPIC};
use im_test_support::{InMemoryRawStore, InMemorySeqCache, InMemoryStore, MockWsClient};
use tokio_util::sync::CancellationToken;

type TestState = AppState<InMemorySeqCache, InMemoryRawStore, InMemoryStore>;

/// Boots a gateway instance on an ephemeral port with every backing store
/// in-memory, plus a live Pusher consumer-group task fed by an in-process
/// `MemoryQueue`. Returns the base `ws://` URL, the queue (so a test can
/// publish onto `push` the way the ingest pipeline would once it has
/// durably assigned a seq), and a handle that stops the Pusher on cancel.
async fn spawn_gateway(kick_policy: Arc<dyn KickPolicy>) -> (String, Arc<MemoryQueue>, CancellationToken) {
    let allocator = Allocator::new(InMemorySeqCache::new(), InMemoryStore::new());
    let cache = im_cache::Cache::new(InMemoryRawStore::new());
    let store = InMemoryStore::new();
    let queue = Arc::new(MemoryQueue::new());
    let producer: Arc<dyn Producer<SendMsgReq>> = queue.clone();

    let state: TestState = AppState::new(
        allocator,
        cache,
        store,
        producer,
        Arc::new(EmptyGroupDirectory),
        Arc::new(PassThroughVerifier),
        kick_policy,
        50_000,
    );

    let shutdown = CancellationToken::new();
    let pusher_consumer: MemoryConsumerGroup<Message> = MemoryConsumerGroup::new(queue.clone());
    let handler = Arc::new(pusher::Pusher::from_state(&state));
    let pusher_shutdown = shutdown.clone();
    tokio::spawn(async move {
        pusher_consumer.run(PUSH_TOPIC, handler, pusher_shutdown).await;
    });
    // Give the consumer task a chance to subscribe before any test publishes.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("ws://{addr}"), queue, shutdown)
}

fn message(id: i64, conversation_id: &str, seq: i64, target_id: &str) -> Message {
    Message {
        id,
        conversation_id: conversation_id.to_owned(),
        seq,
        sender_id: "1".to_owned(),
        target_id: target_id.to_owned(),
        conv_type: ConvType::Single,
        msg_type: 100,
        content: serde_json::json!({"text": "hi"}),
        send_time: 0,
        create_time: 0,
    }
}

#[tokio::test]
async fn send_msg_is_acked_immediately_and_queued_for_ingest() {
    let (base, _queue, _shutdown) = spawn_gateway(Arc::new(NoKickPolicy)).await;
    let mut client = MockWsClient::connect(&format!("{base}/ws?token=alice&platformID=0")).await.unwrap();

    client
        .send(
            req_identifier::WS_SEND_MSG,
            "i1",
            serde_json::to_value(SendMsgReq {
                sender_id: String::new(),
                target_id: "bob".to_owned(),
                conv_type: ConvType::Single,
                msg_type: 100,
                content: serde_json::json!({"text": "hello"}),
                client_msg_id: "c1".to_owned(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let env = client.recv().await.unwrap();
    assert_eq!(env.code, codes::OK);
    let resp: SendMsgResp = serde_json::from_value(env.data).unwrap();
    assert_eq!(resp.client_msg_id, "c1");
    assert_eq!(resp.conversation_id, "single:alice_bob");
    client.close().await.unwrap();
}

#[tokio::test]
async fn unknown_req_identifier_gets_unknown_request_code() {
    let (base, _queue, _shutdown) = spawn_gateway(Arc::new(NoKickPolicy)).await;
    let mut client = MockWsClient::connect(&format!("{base}/ws?token=alice&platformID=0")).await.unwrap();

    client.send(9999, "i1", serde_json::Value::Null).await.unwrap();
    let env = client.recv().await.unwrap();
    assert_eq!(env.code, codes::UNKNOWN_REQUEST);
    client.close().await.unwrap();
}

#[tokio::test]
async fn live_recipient_session_receives_fan_out_push() {
    let (base, queue, shutdown) = spawn_gateway(Arc::new(NoKickPolicy)).await;
    let sender = MockWsClient::connect(&format!("{base}/ws?token=alice&platformID=0")).await.unwrap();
    let mut recipient = MockWsClient::connect(&format!("{base}/ws?token=bob&platformID=0")).await.unwrap();
    // Let both upgrades land in the registry before the push is produced.
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Simulate the ingest pipeline's own publish onto `push` once it has
    // durably assigned a seq/msg_id; this gateway instance never runs an
    // ingest worker, only the Pusher consuming the same in-process queue.
    let msg = message(100, "single:alice_bob", 1, "bob");
    queue.send(PUSH_TOPIC, &msg.conversation_id, &msg).await.unwrap();

    let env = recipient.recv().await.unwrap();
    assert_eq!(env.req_identifier, req_identifier::WS_PUSH_MSG);
    let pushed: Message = serde_json::from_value(env.data).unwrap();
    assert_eq!(pushed.id, 100);
    assert_eq!(pushed.seq, 1);

    drop(sender);
    recipient.close().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn single_platform_kick_policy_closes_the_prior_session() {
    let (base, _queue, _shutdown) = spawn_gateway(Arc::new(SinglePlatformSessionPolicy)).await;
    let mut first = MockWsClient::connect(&format!("{base}/ws?token=alice&platformID=0")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _second = MockWsClient::connect(&format!("{base}/ws?token=alice&platformID=0")).await.unwrap();

    let env = first.recv().await.unwrap();
    assert_eq!(env.req_identifier, req_identifier::WS_KICK_ONLINE_MSG);
    // The server closes the underlying socket right after the kick frame;
    // the next read must observe that close rather than hang.
    assert!(first.recv().await.is_err());
}

#[tokio::test]
async fn healthz_and_metrics_respond_over_plain_http() {
    let (base, _queue, _shutdown) = spawn_gateway(Arc::new(NoKickPolicy)).await;
    let http_base = base.replacen("ws://", "http://", 1);

    let health = reqwest::get(format!("{http_base}/healthz")).await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");

    let metrics = reqwest::get(format!("{http_base}/metrics")).await.unwrap();
    assert_eq!(metrics.status(), 200);
    assert!(metrics.text().await.unwrap().contains("online_user_gauge 0"));
}

#[tokio::test]
async fn get_newest_seq_reports_an_empty_map_for_a_user_with_no_conversations() {
    let (base, _queue, _shutdown) = spawn_gateway(Arc::new(NoKickPolicy)).await;
    let mut client = MockWsClient::connect(&format!("{base}/ws?token=alice&platformID=0")).await.unwrap();

    client.send(req_identifier::WS_GET_NEWEST_SEQ, "i1", serde_json::Value::Null).await.unwrap();
    let env = client.recv().await.unwrap();
    assert_eq!(env.code, codes::OK);
    let resp: im_protocol::GetNewestSeqResp = serde_json::from_value(env.data).unwrap();
    assert!(resp.max_seqs.is_empty());
    client.close().await.unwrap();
}
