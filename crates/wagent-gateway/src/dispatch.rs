//! Webhook event routing: `message` events feed the intervention
//! controller and the merger; `session.status` updates the session row;
//! `message.ack` records delivery marks; `call.*` is logged only.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use wagent_core::types::ConnectionStatus;
use wagent_core::ChatKey;
use wagent_merger::IncomingChatMessage;
use wagent_store::types::SessionRecord;

use crate::app::AppState;

pub async fn dispatch_event(
    state: Arc<AppState>,
    session: SessionRecord,
    event_name: String,
    event: Value,
    request_id: String,
) {
    let payload = event.get("payload").cloned().unwrap_or(Value::Null);

    match event_name.as_str() {
        "message" => handle_message(state, session, payload, &request_id).await,
        "session.status" => handle_session_status(state, session, payload),
        "message.ack" => handle_message_ack(state, session, payload),
        other if other.starts_with("call.") => {
            info!(event = other, wa_account_id = %session.wa_account_id, "call event ignored");
        }
        other => {
            debug!(event = other, "unhandled webhook event class");
        }
    }
}

/// An inbound user message: apply the punctuation side-channel first,
/// then hand the message to the merge window. The punctuation command
/// runs before the gate so "stop," suppresses its own reply.
async fn handle_message(
    state: Arc<AppState>,
    session: SessionRecord,
    payload: Value,
    request_id: &str,
) {
    // Echoes of our own outbound messages come back through the same
    // webhook; never feed them into the pipeline.
    if payload.get("fromMe").and_then(|v| v.as_bool()).unwrap_or(false) {
        return;
    }

    let Some(chat_id) = payload.get("from").and_then(|v| v.as_str()) else {
        warn!(request_id, "message payload missing 'from'");
        return;
    };
    let text = payload
        .get("body")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let has_media = payload
        .get("hasMedia")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if text.trim().is_empty() && !has_media {
        return;
    }

    let chat_key = ChatKey::new(&session.user_id, &session.wa_account_id, chat_id);

    if let Err(e) = state.pipeline.intervention.apply_punctuation(&chat_key, &text) {
        warn!(request_id, chat_key = %chat_key, error = %e, "punctuation command failed");
    }

    let message = IncomingChatMessage {
        chat_key: chat_key.clone(),
        session_id: session.id.clone(),
        message_id: payload
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or(request_id)
            .to_string(),
        text,
        // WAHA timestamps are epoch seconds.
        timestamp_ms: payload
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .map(|s| s * 1000)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        has_media,
        agent_id: payload
            .get("agentId")
            .and_then(|v| v.as_str())
            .map(String::from),
    };

    if let Err(e) = state.merger.submit(message).await {
        warn!(request_id, chat_key = %chat_key, error = %e, "merger submit failed");
    }
}

/// Session lifecycle update from WAHA. Unknown statuses are logged and
/// ignored rather than corrupting the row.
fn handle_session_status(state: Arc<AppState>, session: SessionRecord, payload: Value) {
    let Some(status_str) = payload.get("status").and_then(|v| v.as_str()) else {
        warn!(wa_account_id = %session.wa_account_id, "session.status missing status");
        return;
    };
    let status = match normalize_status(status_str) {
        Some(s) => s,
        None => {
            warn!(
                wa_account_id = %session.wa_account_id,
                status = status_str,
                "unknown session status ignored"
            );
            return;
        }
    };
    if let Err(e) = state.pipeline.sessions.set_status(&session.wa_account_id, status) {
        warn!(wa_account_id = %session.wa_account_id, error = %e, "session status update failed");
    } else {
        info!(wa_account_id = %session.wa_account_id, status = %status, "session status updated");
    }
}

/// Best-effort delivery mark for the chat's most recent assistant turn.
fn handle_message_ack(state: Arc<AppState>, session: SessionRecord, payload: Value) {
    let Some(chat_id) = payload
        .get("from")
        .or_else(|| payload.get("to"))
        .and_then(|v| v.as_str())
    else {
        return;
    };
    let ack = payload
        .get("ackName")
        .and_then(|v| v.as_str())
        .unwrap_or("delivered");

    let chat_key = ChatKey::new(&session.user_id, &session.wa_account_id, chat_id).format();
    let last_turn = match state.pipeline.conversations.get(&chat_key) {
        Ok(Some(conv)) => conv.last_turn,
        _ => return,
    };
    if let Err(e) = state.pipeline.messages.set_delivery_ack(&chat_key, last_turn, ack) {
        debug!(chat_key, error = %e, "delivery ack update skipped");
    }
}

/// Map WAHA's status vocabulary onto ours.
fn normalize_status(s: &str) -> Option<ConnectionStatus> {
    match s.to_ascii_uppercase().as_str() {
        "STARTING" | "CONNECTING" => Some(ConnectionStatus::Connecting),
        "SCAN_QR_CODE" | "SCAN_QR" => Some(ConnectionStatus::ScanQr),
        "WORKING" | "CONNECTED" => Some(ConnectionStatus::Working),
        "FAILED" => Some(ConnectionStatus::Failed),
        "STOPPED" => Some(ConnectionStatus::Stopped),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_vocabulary_maps() {
        assert_eq!(normalize_status("WORKING"), Some(ConnectionStatus::Working));
        assert_eq!(normalize_status("SCAN_QR_CODE"), Some(ConnectionStatus::ScanQr));
        assert_eq!(normalize_status("starting"), Some(ConnectionStatus::Connecting));
        assert_eq!(normalize_status("STOPPED"), Some(ConnectionStatus::Stopped));
        assert_eq!(normalize_status("MYSTERY"), None);
    }
}
