use serde::Deserialize;

/// Outcome of a `sendText` call as reported by WAHA.
#[derive(Debug, Clone, Deserialize)]
pub struct SendResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// WAHA message id of the delivered text, when reported.
    #[serde(default)]
    pub id: Option<String>,
}

/// Session status as reported by `GET /api/sessions/{name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStatusInfo {
    pub name: String,
    pub status: String,
}

/// Version payload from `GET /api/version`.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}
