use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Pipeline constants shared across stages.
pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Merge-window bounds in milliseconds. Values outside the admissible
/// range are rejected at config validation, not clamped.
pub const MERGE_WINDOW_DEFAULT_MS: u64 = 2000;
pub const MERGE_WINDOW_MIN_MS: u64 = 1500;
pub const MERGE_WINDOW_MAX_MS: u64 = 3000;

/// A buffered message longer than this flushes the merge window immediately.
pub const MERGE_IMMEDIATE_FLUSH_CHARS: usize = 500;

/// Webhook dedup keys expire after 24 hours.
pub const DEDUP_TTL_HOURS: i64 = 24;
/// Intervention audit entries are retained for ~30 days.
pub const AUDIT_TTL_DAYS: i64 = 30;

/// External call timeouts (seconds).
pub const EMBEDDING_TIMEOUT_SECS: u64 = 10;
pub const LLM_TIMEOUT_SECS: u64 = 30;
pub const VECTOR_SEARCH_TIMEOUT_SECS: u64 = 5;
pub const WAHA_TIMEOUT_SECS: u64 = 10;

/// Top-level config (wagent.toml + WAGENT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagentConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub humanizer: HumanizerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    /// Process-wide key for sealing per-tenant WAHA API keys.
    /// Must be at least 32 characters; immutable after startup.
    /// Override with env var: WAGENT_ENCRYPTION_KEY
    #[serde(default)]
    pub encryption_key: String,
}

impl Default for WagentConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            merge: MergeConfig::default(),
            humanizer: HumanizerConfig::default(),
            pipeline: PipelineConfig::default(),
            vector: VectorConfig::default(),
            encryption_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Merge-window tuning for the chat session merger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Sliding window in milliseconds. Admissible range: [1500, 3000].
    #[serde(default = "default_merge_window_ms")]
    pub window_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            window_ms: MERGE_WINDOW_DEFAULT_MS,
        }
    }
}

/// Outbound humanizer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanizerConfig {
    /// Whether to drive the WAHA typing indicator around each segment.
    #[serde(default = "bool_true")]
    pub typing_indicator: bool,
    /// Base delay for sendText retry backoff, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for HumanizerConfig {
    fn default() -> Self {
        Self {
            typing_indicator: true,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Queue-worker tuning for the three pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Parallel workers per stage queue.
    #[serde(default = "default_workers")]
    pub workers_per_stage: usize,
    /// Maximum redeliveries for a transiently failed stage message.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// A `processing` job older than this is considered stale and superseded.
    #[serde(default = "default_stale_job_secs")]
    pub stale_job_secs: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers_per_stage: default_workers(),
            max_attempts: default_max_attempts(),
            stale_job_secs: default_stale_job_secs(),
        }
    }
}

/// Deployment-level binding to the external vector index.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VectorConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.wagent/wagent.db", home)
}
fn default_merge_window_ms() -> u64 {
    MERGE_WINDOW_DEFAULT_MS
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_workers() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_stale_job_secs() -> i64 {
    300
}
fn bool_true() -> bool {
    true
}

impl WagentConfig {
    /// Load config: explicit path > WAGENT_CONFIG env > ~/.wagent/wagent.toml,
    /// with WAGENT_* env vars layered on top.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: WagentConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("WAGENT_"))
            .extract()
            .map_err(|e| crate::error::WagentError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range knobs up front rather than misbehaving later.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.merge.window_ms < MERGE_WINDOW_MIN_MS || self.merge.window_ms > MERGE_WINDOW_MAX_MS
        {
            return Err(crate::error::WagentError::Config(format!(
                "merge window {}ms outside admissible range [{}, {}]",
                self.merge.window_ms, MERGE_WINDOW_MIN_MS, MERGE_WINDOW_MAX_MS
            )));
        }
        if !self.encryption_key.is_empty() && self.encryption_key.len() < 32 {
            return Err(crate::error::WagentError::Config(
                "encryption_key must be at least 32 characters".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.wagent/wagent.toml", home)
}
