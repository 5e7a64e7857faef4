// Ad hoc atomic counters exposed as a plain-text `/metrics` handler, per
// SPEC_FULL.md §6/§9: the teacher never pulls in a `prometheus`/`metrics`
// crate, so this follows the same texture rather than introducing one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

#[derive(Default)]
pub struct Metrics {
    success_total: AtomicU64,
    failed_total: AtomicU64,
}

impl Metrics {
    pub fn record_success(&self, n: usize) {
        if n > 0 {
            self.success_total.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, n: usize) {
        if n > 0 {
            self.failed_total.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    fn render(&self) -> String {
        format!(
            "msg_process_success_total {}\nmsg_process_failed_total {}\n",
            self.success_total.load(Ordering::Relaxed),
            self.failed_total.load(Ordering::Relaxed),
        )
    }
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(move || {
                let metrics = metrics.clone();
                async move { metrics.render() }
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_reflects_recorded_counts() {
        let metrics = Metrics::default();
        metrics.record_success(3);
        metrics.record_failure(1);
        let rendered = metrics.render();
        assert!(rendered.contains("msg_process_success_total 3"));
        assert!(rendered.contains("msg_process_failed_total 1"));
    }
}
