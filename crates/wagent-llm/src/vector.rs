use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::provider::ProviderError;

/// Vector-index query seam; a trait so retrieve-stage tests can use a
/// canned index.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        kb_id: &str,
    ) -> Result<Vec<VectorMatch>, ProviderError>;
}

#[async_trait]
impl VectorSearch for VectorIndexClient {
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        kb_id: &str,
    ) -> Result<Vec<VectorMatch>, ProviderError> {
        VectorIndexClient::query(self, vector, top_k, kb_id).await
    }
}

/// HTTP client for the external vector index.
///
/// One endpoint: `POST {base_url}/query` with a vector, a topK, and a
/// knowledge-base filter. Chunk texts are NOT stored in the index; the
/// retrieve stage hydrates them from the durable store by match id.
pub struct VectorIndexClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

/// Query parameters for one search.
#[derive(Debug, Clone, Serialize)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    #[serde(rename = "topK")]
    pub top_k: usize,
    pub filter: VectorFilter,
    #[serde(rename = "returnMetadata")]
    pub return_metadata: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorFilter {
    pub kb_id: String,
}

/// One match from the index. `id` is the vector id that keys the chunk
/// row in the durable store.
#[derive(Debug, Clone, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    matches: Vec<VectorMatch>,
}

impl VectorIndexClient {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            timeout,
        }
    }

    /// Search one knowledge base. Matches come back score-descending.
    pub async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        kb_id: &str,
    ) -> Result<Vec<VectorMatch>, ProviderError> {
        let body = VectorQuery {
            vector: vector.to_vec(),
            top_k,
            filter: VectorFilter {
                kb_id: kb_id.to_string(),
            },
            return_metadata: true,
        };
        let url = format!("{}/query", self.base_url);

        debug!(kb_id, top_k, dims = vector.len(), "vector query");

        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "vector index error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let parsed: QueryResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parsed.matches)
    }
}
