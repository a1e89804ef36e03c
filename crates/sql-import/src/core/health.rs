//! Connection health check result.

use serde::Serialize;

/// Outcome of a single connectivity check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthStatus {
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn ok(latency_ms: u64, version: Option<String>) -> Self {
        Self {
            connected: true,
            latency_ms,
            version,
            error: None,
        }
    }

    pub fn failed(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            connected: false,
            latency_ms,
            version: None,
            error: Some(error.into()),
        }
    }
}
