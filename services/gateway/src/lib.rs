pub mod auth;
pub mod config;
pub mod dispatch;
pub mod group;
pub mod kick;
pub mod pull_sync;
pub mod pusher;
pub mod registry;
pub mod session;
pub mod state;
pub mod ws;

use axum::routing::get;
use axum::Router;
use im_allocator::SeqCache;
use im_cache::RawStore;
use im_store::{MessageStore, SeqStore};

pub use state::AppState;

/// Builds the gateway's router: the WebSocket upgrade endpoint plus a bare
/// liveness check, matching the teacher's own `/healthz` convention in
/// `services/server`'s `build_router`.
pub fn build_router<Csq, Rs, St>(state: AppState<Csq, Rs, St>) -> Router
where
    Csq: SeqCache + 'static,
    Rs: RawStore + 'static,
    St: MessageStore + SeqStore + 'static,
{
    Router::new()
        .route("/ws", get(ws::ws_handler::<Csq, Rs, St>))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::<Csq, Rs, St>))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Plain-text exposition of this process's share of the ambient metrics
/// set (`online_user_gauge`); `msg_process_success_total`/`_failed_total`
/// are the ingest pipeline's own counters, not this process's.
async fn metrics<Csq, Rs, St>(
    axum::extract::State(state): axum::extract::State<AppState<Csq, Rs, St>>,
) -> String
where
    Csq: SeqCache + 'static,
    Rs: RawStore + 'static,
    St: MessageStore + SeqStore + 'static,
{
    format!("online_user_gauge {}\n", state.registry.online_user_count().await)
}
