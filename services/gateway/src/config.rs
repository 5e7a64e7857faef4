// Boot-time config, promoted from ad hoc `env::var` calls to a typed
// `clap::Parser` struct with `env` derive attributes, per SPEC_FULL.md §6 —
// the same shape the teacher's `receiver`/`forwarder`/`streamer` binaries
// use for their own `Config`, just with this service's own variable names.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "gateway", about = "Connection Gateway + Session Registry + Fan-out Pusher")]
pub struct Config {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[arg(long, env = "KAFKA_BROKERS", default_value = "127.0.0.1:9092")]
    pub kafka_brokers: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Process-wide cap on concurrently open WebSocket sessions, per
    /// spec.md §4.G's connection-cap invariant.
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 50_000)]
    pub max_connections: usize,
}
