//! WAHA webhook ingress — POST /api/webhooks/waha/{wa_account_id}.
//!
//! Verifies the per-session HMAC signature over the raw body, dedupes
//! message events by payload id, acknowledges synchronously, and hands
//! the event to the dispatcher on a spawned task.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::dispatch;

type HmacSha256 = Hmac<Sha256>;

/// POST /api/webhooks/waha/{wa_account_id}
///
/// Returns 200 + request id immediately; event processing is
/// asynchronous. 401 on bad signature, 404 on unknown account, 400 on
/// malformed JSON.
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(wa_account_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let session = state
        .pipeline
        .sessions
        .get_by_account(&wa_account_id)
        .map_err(internal_error)?
        .ok_or_else(|| {
            warn!(wa_account_id, "webhook for unknown account");
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "unknown account"})),
            )
        })?;

    verify_signature(&headers, &body, &session.webhook_secret).map_err(|reason| {
        warn!(wa_account_id, reason, "webhook signature rejected");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed"})),
        )
    })?;

    let event: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(wa_account_id, error = %e, "invalid JSON in webhook body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
    })?;

    let request_id = Uuid::new_v4().to_string();
    let event_name = event
        .get("event")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    // Replay of a message we already accepted within the TTL: ack
    // without reprocessing.
    if event_name == "message" {
        let key = dedup_key(&wa_account_id, &event);
        match state.dedup.check_and_insert(&key) {
            Ok(true) => {}
            Ok(false) => {
                info!(wa_account_id, key, "duplicate webhook message ignored");
                return Ok(Json(json!({"success": true, "requestId": request_id})));
            }
            Err(e) => return Err(internal_error(e)),
        }
    }

    info!(wa_account_id, event = %event_name, request_id = %request_id, "webhook accepted");

    // Ack now, process later — the gate is single-digit milliseconds.
    let state2 = Arc::clone(&state);
    let request_id2 = request_id.clone();
    tokio::spawn(async move {
        dispatch::dispatch_event(state2, session, event_name, event, request_id2).await;
    });

    Ok(Json(json!({"success": true, "requestId": request_id})))
}

/// Verify `HMAC-SHA256(body, secret)` against `x-hub-signature-256`
/// (accepting either `sha256=<hex>` or raw hex) or `x-signature`.
fn verify_signature(headers: &HeaderMap, body: &Bytes, secret: &str) -> Result<(), &'static str> {
    let provided = headers
        .get("x-hub-signature-256")
        .or_else(|| headers.get("x-signature"))
        .and_then(|v| v.to_str().ok())
        .ok_or("missing signature header")?;

    let sig_hex = provided.strip_prefix("sha256=").unwrap_or(provided);
    let expected = hex::decode(sig_hex).map_err(|_| "signature is not valid hex")?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "invalid HMAC key length")?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch")
}

/// Idempotency key for a message event: `payload.id`, falling back to
/// `waAccountId:timestamp` when absent (not collision-proof under high
/// concurrency; accepted as-is).
fn dedup_key(wa_account_id: &str, event: &Value) -> String {
    let payload = event.get("payload");
    if let Some(id) = payload
        .and_then(|p| p.get("id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        return id.to_string();
    }
    let ts = payload
        .and_then(|p| p.get("timestamp"))
        .and_then(|v| v.as_i64())
        .unwrap_or_default();
    format!("{}:{}", wa_account_id, ts)
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    warn!(error = %e, "webhook internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
}
