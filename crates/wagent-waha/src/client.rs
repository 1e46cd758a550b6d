//! Minimal WAHA REST client.
//!
//! One client per tenant session: the endpoint URL and API key come
//! from the session row (key decrypted on demand, never cached).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Result, WahaError};
use crate::types::{SendResult, SessionStatusInfo, VersionInfo};

/// The slice of the WAHA API the reply stage drives. A trait so tests
/// can substitute a scripted transport.
#[async_trait]
pub trait WahaTransport: Send + Sync {
    async fn start_typing(&self, session: &str, chat_id: &str) -> Result<()>;
    async fn stop_typing(&self, session: &str, chat_id: &str) -> Result<()>;
    async fn send_text(&self, session: &str, chat_id: &str, text: &str) -> Result<SendResult>;
}

#[async_trait]
impl WahaTransport for WahaClient {
    async fn start_typing(&self, session: &str, chat_id: &str) -> Result<()> {
        WahaClient::start_typing(self, session, chat_id).await
    }

    async fn stop_typing(&self, session: &str, chat_id: &str) -> Result<()> {
        WahaClient::stop_typing(self, session, chat_id).await
    }

    async fn send_text(&self, session: &str, chat_id: &str, text: &str) -> Result<SendResult> {
        WahaClient::send_text(self, session, chat_id, text).await
    }
}

pub struct WahaClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl WahaClient {
    /// `base_url` without a trailing slash, e.g. `http://waha:3000`.
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url,
            api_key,
        }
    }

    /// Start (or restart) a WAHA session for this account.
    pub async fn create_session(&self, session: &str, webhook_url: &str) -> Result<()> {
        let body = json!({
            "name": session,
            "config": {
                "webhooks": [{"url": webhook_url, "events": ["message", "session.status", "message.ack"]}]
            }
        });
        self.post_expect_ok(&format!("{}/api/sessions", self.base_url), &body)
            .await
    }

    pub async fn get_session_status(&self, session: &str) -> Result<SessionStatusInfo> {
        let url = format!("{}/api/sessions/{}", self.base_url, session);
        let resp = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(api_error(status, resp.text().await.unwrap_or_default()));
        }
        resp.json().await.map_err(|e| WahaError::Parse(e.to_string()))
    }

    pub async fn restart_session(&self, session: &str) -> Result<()> {
        let url = format!("{}/api/sessions/{}/restart", self.base_url, session);
        self.post_expect_ok(&url, &json!({})).await
    }

    /// Base64-encoded QR code for pairing, while the session is in `scan_qr`.
    pub async fn get_qr_code(&self, session: &str) -> Result<String> {
        let url = format!("{}/api/{}/auth/qr", self.base_url, session);
        let resp = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(api_error(status, resp.text().await.unwrap_or_default()));
        }
        let value: serde_json::Value =
            resp.json().await.map_err(|e| WahaError::Parse(e.to_string()))?;
        value
            .get("value")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| WahaError::Parse("QR response missing value".to_string()))
    }

    /// Show the typing indicator in a chat.
    pub async fn start_typing(&self, session: &str, chat_id: &str) -> Result<()> {
        let url = format!("{}/api/startTyping", self.base_url);
        self.post_expect_ok(&url, &json!({"session": session, "chatId": chat_id}))
            .await
    }

    /// Clear the typing indicator.
    pub async fn stop_typing(&self, session: &str, chat_id: &str) -> Result<()> {
        let url = format!("{}/api/stopTyping", self.base_url);
        self.post_expect_ok(&url, &json!({"session": session, "chatId": chat_id}))
            .await
    }

    /// Send one text message. A 2xx with `success: false` is a rejected
    /// send, reported separately from transport errors.
    pub async fn send_text(&self, session: &str, chat_id: &str, text: &str) -> Result<SendResult> {
        let url = format!("{}/api/sendText", self.base_url);
        let body = json!({"session": session, "chatId": chat_id, "text": text});

        debug!(session, chat_id, chars = text.len(), "sendText");

        let resp = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "sendText API error");
            return Err(api_error(status, text));
        }

        let result: SendResult = resp
            .json()
            .await
            .map_err(|e| WahaError::Parse(e.to_string()))?;
        if !result.success {
            return Err(WahaError::SendRejected(
                result.error.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }
        Ok(result)
    }

    /// Fail fast when the WAHA deployment is older than we support.
    pub async fn ensure_version(&self, min_version: &str) -> Result<()> {
        let url = format!("{}/api/version", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(api_error(status, resp.text().await.unwrap_or_default()));
        }
        let info: VersionInfo = resp
            .json()
            .await
            .map_err(|e| WahaError::Parse(e.to_string()))?;
        if version_lt(&info.version, min_version) {
            return Err(WahaError::VersionTooOld {
                found: info.version,
                required: min_version.to_string(),
            });
        }
        Ok(())
    }

    async fn post_expect_ok(&self, url: &str, body: &serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .header("X-Api-Key", &self.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, url, body = %text, "WAHA API error");
            return Err(api_error(status, text));
        }
        Ok(())
    }
}

fn api_error(status: u16, message: String) -> WahaError {
    WahaError::Api { status, message }
}

/// Compare dotted numeric versions, missing segments count as zero.
fn version_lt(found: &str, required: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.trim_start_matches('v')
            .split('.')
            .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    let a = parse(found);
    let b = parse(required);
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x < y;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison() {
        assert!(version_lt("2024.1.0", "2024.2.0"));
        assert!(!version_lt("2024.2.0", "2024.2.0"));
        assert!(!version_lt("2024.10.1", "2024.2.9"));
        assert!(version_lt("v1.9", "1.10"));
        assert!(!version_lt("2.0.0-beta", "2.0.0"));
    }

    #[test]
    fn send_result_parses_failure() {
        let json = r#"{"success": false, "error": "chat not found"}"#;
        let result: SendResult = serde_json::from_str(json).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("chat not found"));
    }
}
