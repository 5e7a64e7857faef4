use std::sync::Arc;

use clap::Parser;
use im_allocator::{Allocator, RedisSeqCache};
use im_cache::{Cache, RedisStore};
use im_queue::{ConsumerGroup, KafkaConsumerGroup, KafkaProducer, INGEST_TOPIC};
use im_store::{IdGenerator, Store};
use ingest::config::Config;
use ingest::timeline::RecipientTimelinePolicy;
use ingest::{metrics::Metrics, IngestHandler, IngestPipeline};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

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
    let allocator = Arc::new(Allocator::new(RedisSeqCache::new(redis_conn.clone()), store.clone()));
    let cache = Arc::new(Cache::new(RedisStore::new(redis_conn)));
    let store = Arc::new(store);

    let producer = Arc::new(KafkaProducer::new(&config.kafka_brokers).expect("failed to configure Kafka producer"));
    let id_gen = Arc::new(IdGenerator::new(config.machine_id));
    let metrics = Arc::new(Metrics::default());

    let pipeline = Arc::new(IngestPipeline::spawn(
        config.batch_config(),
        allocator,
        cache,
        store,
        producer,
        id_gen,
        Arc::new(RecipientTimelinePolicy),
        metrics.clone(),
    ));

    let ingest_consumer = KafkaConsumerGroup::new(config.kafka_brokers.clone(), "ingest-cg");
    let consumer_shutdown = CancellationToken::new();
    let consumer_handle = {
        let handler = Arc::new(IngestHandler::new(pipeline.clone()));
        let shutdown = consumer_shutdown.clone();
        tokio::spawn(async move {
            ingest_consumer.run(INGEST_TOPIC, handler, shutdown).await;
        })
    };

    let router = ingest::metrics::router(metrics);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "ingest pipeline listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    consumer_shutdown.cancel();
    let _ = consumer_handle.await;
    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.close().await,
        Err(_) => info!("pipeline still referenced at shutdown, skipping drain"),
    }
    info!("ingest pipeline shut down gracefully");
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
