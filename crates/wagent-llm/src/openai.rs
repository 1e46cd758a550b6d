use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};

/// OpenAI-compatible provider built per request from tenant credentials.
///
/// `base_url` should NOT include a trailing slash; the standard
/// `/chat/completions` and `/embeddings` paths are appended.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider_name: String,
    /// Chat calls run much longer than embedding calls, so each request
    /// carries its own timeout instead of a client-wide one.
    chat_timeout: Duration,
    embed_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        base_url: String,
        chat_timeout: Duration,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider_name: "openai".to_string(),
            api_key,
            base_url,
            chat_timeout,
            embed_timeout,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = serde_json::json!({
            "model": req.model,
            "messages": req.messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %req.model, "sending chat request");

        let resp = self
            .client
            .post(&url)
            .timeout(self.chat_timeout)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000) // convert seconds to ms
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "chat completions API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = api_resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(ProviderError::EmptyCompletion);
        }

        let usage = api_resp.usage.unwrap_or_default();
        Ok(ChatResponse {
            content,
            model: api_resp.model.unwrap_or_else(|| req.model.clone()),
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
        })
    }

    async fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": model,
            "input": [input],
        });
        let url = format!("{}/embeddings", self.base_url);

        debug!(model, chars = input.len(), "sending embedding request");

        let resp = self
            .client
            .post(&url)
            .timeout(self.embed_timeout)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "embeddings API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        api_resp
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::Parse("no embedding in response".to_string()))
    }
}

// ── Wire DTOs ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CompletionResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_response_parses() {
        let json = r#"{
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }"#;
        let resp: CompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(resp.usage.unwrap().prompt_tokens, 12);
    }

    #[test]
    fn completion_without_usage_parses() {
        let json = r#"{"choices": [{"message": {"content": null}}]}"#;
        let resp: CompletionResponse = serde_json::from_str(json).unwrap();
        assert!(resp.choices[0].message.content.is_none());
        assert!(resp.usage.is_none());
    }

    #[test]
    fn embedding_response_parses() {
        let json = r#"{"data": [{"embedding": [0.1, -0.2, 0.3], "index": 0}]}"#;
        let resp: EmbeddingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.data[0].embedding.len(), 3);
    }
}
