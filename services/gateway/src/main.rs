use std::sync::Arc;

use clap::Parser;
use gateway::auth::PassThroughVerifier;
use gateway::config::Config;
use gateway::group::EmptyGroupDirectory;
use gateway::kick::NoKickPolicy;
use gateway::state::AppState;
use gateway::{build_router, pusher};
use im_allocator::{Allocator, RedisSeqCache};
use im_cache::{Cache, RedisStore};
use im_queue::{ConsumerGroup, KafkaConsumerGroup, KafkaProducer, PUSH_TOPIC};
use im_store::Store;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

type ProdState = AppState<RedisSeqCache, RedisStore, Store>;

#[tokio::main]
async fn main() {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    info!("connecting to database...");
    let pool = im_store::create_pool(&config.database_url)
        .await
        .expect("failed to connect to Postgres");
    im_store::run_migrations(&pool).await.expect("failed to run migrations");
    info!("migrations applied");

    info!("connecting to redis...");
    let redis_client = redis::Client::open(config.redis_url.clone()).expect("invalid REDIS_URL");
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .expect("failed to connect to Redis");

    let store = Store::new(pool);
    let allocator = Allocator::new(RedisSeqCache::new(redis_conn.clone()), store.clone());
    let cache = Cache::new(RedisStore::new(redis_conn));

    let producer = Arc::new(KafkaProducer::new(&config.kafka_brokers).expect("failed to configure Kafka producer"));
    let pusher_consumer = KafkaConsumerGroup::new(config.kafka_brokers.clone(), "gateway-pusher-cg");

    let state = ProdState::new(
        allocator,
        cache,
        store,
        producer,
        Arc::new(EmptyGroupDirectory),
        Arc::new(PassThroughVerifier),
        Arc::new(NoKickPolicy),
        config.max_connections,
    );

    let pusher_shutdown = CancellationToken::new();
    let pusher_handle = {
        let handler = Arc::new(pusher::Pusher::from_state(&state));
        let shutdown = pusher_shutdown.clone();
        tokio::spawn(async move {
            pusher_consumer.run(PUSH_TOPIC, handler, shutdown).await;
        })
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    pusher_shutdown.cancel();
    let _ = pusher_handle.await;
    info!("gateway shut down gracefully");
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
