use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use wagent_core::config::WagentConfig;
use wagent_merger::{ChatMerger, MergedRequest};
use wagent_pipeline::{PipelineContext, StageQueue};
use wagent_store::dedup::DedupStore;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: WagentConfig,
    pub pipeline: Arc<PipelineContext>,
    pub merger: Arc<ChatMerger>,
    pub dedup: Arc<DedupStore>,
    pub retrieve_queue: StageQueue<MergedRequest>,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/api/webhooks/waha/{wa_account_id}",
            post(crate::http::webhooks::webhook_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
