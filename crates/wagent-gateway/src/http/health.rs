use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness probe with queue depths for operators.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "merge_window_ms": state.config.merge.window_ms,
        "active_chats": state.merger.active_chats(),
        "queues": {
            "retrieve": state.retrieve_queue.depth(),
            "infer": state.pipeline.infer_queue.depth(),
            "reply": state.pipeline.reply_queue.depth(),
        },
    }))
}
