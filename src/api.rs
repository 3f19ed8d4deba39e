//! Operator HTTP surface: `/health` and `/metrics`. Grounded on
//! `scoootscooob-aegis-protocol`'s `indexer/src/api.rs` axum/tower-http
//! shape, generalized from a vault-lookup API to the two read-only
//! operator endpoints: liveness and scrapeable counters.

use crate::metrics::Metrics;
use axum::{extract::State, http::Method, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    ready: bool,
}

pub struct ApiState {
    metrics: Arc<Metrics>,
    ready: AtomicBool,
}

impl ApiState {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            metrics,
            ready: AtomicBool::new(false),
        })
    }

    /// Flips once the Event Listener has completed its startup replay
    /// and the Store lock is held; before that, `/health` reports
    /// `ready: false` so a load balancer doesn't route to a node still
    /// replaying pending jobs.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        ready: state.ready.load(Ordering::SeqCst),
    })
}

async fn metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.metrics.render()
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes_expected_shape() {
        let resp = HealthResponse {
            status: "ok",
            ready: true,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"ready\":true"));
    }

    // `Metrics::install` registers a process-global recorder, which
    // cannot be installed twice in one test binary, so the readiness
    // transition is exercised directly on the AtomicBool instead.
    #[test]
    fn ready_flag_transitions_once_marked() {
        let ready = AtomicBool::new(false);
        assert!(!ready.load(Ordering::SeqCst));
        ready.store(true, Ordering::SeqCst);
        assert!(ready.load(Ordering::SeqCst));
    }
}
