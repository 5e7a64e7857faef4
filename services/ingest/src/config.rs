// Boot-time config for the ingest pipeline, same `clap::Parser` + `env`
// shape as `gateway::config::Config` — batch tuning knobs are added on top
// since this binary is the one process that owns a `BatchProcessor`.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "ingest", about = "Ingest Pipeline: allocates seqs, persists, fans out to the push topic")]
pub struct Config {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8081")]
    pub bind_addr: String,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[arg(long, env = "KAFKA_BROKERS", default_value = "127.0.0.1:9092")]
    pub kafka_brokers: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// This process's snowflake machine id. Must be unique across every
    /// concurrently running ingest worker or message ids can collide.
    #[arg(long, env = "MACHINE_ID", default_value_t = 0)]
    pub machine_id: i64,

    #[arg(long, env = "BATCH_SIZE", default_value_t = im_batch::DEFAULT_SIZE)]
    pub batch_size: usize,

    #[arg(long, env = "BATCH_DURATION_MS", default_value_t = 1000)]
    pub batch_duration_ms: u64,

    #[arg(long, env = "BATCH_WORKER_COUNT", default_value_t = im_batch::DEFAULT_WORKER_COUNT)]
    pub batch_worker_count: usize,
}

impl Config {
    pub fn batch_config(&self) -> im_batch::BatchConfig {
        im_batch::BatchConfig {
            size: self.batch_size,
            duration: std::time::Duration::from_millis(self.batch_duration_ms),
            worker_count: self.batch_worker_count,
            chan_size: im_batch::DEFAULT_CHAN_SIZE,
        }
    }
}
