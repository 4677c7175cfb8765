//! Request/response types and configuration for the verification server.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::checks::AuthenticityVerdict;
use crate::store::{BatchRecord, UnitRecord};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to (defaults to 127.0.0.1:8080; use 0.0.0.0 to expose externally)
    pub bind_addr: SocketAddr,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Risk classifier weights artifact.
    pub model_path: PathBuf,
    /// Registry mirror base URL (event-log reads).
    pub ledger_url: String,
    /// Topic submit base URL (notification fan-out).
    pub notify_url: String,
    /// Shared secret the issuing authority signs QR tuples with.
    pub qr_secret: String,
    /// Rate limit in requests per minute per IP (0 = no limit)
    pub rate_limit_rpm: u32,
    /// Path for JSONL access log
    pub access_log_path: String,
    /// Maximum access log file size in bytes before rotation (0 = no limit)
    pub max_access_log_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080"
                .parse()
                .expect("valid default bind address"),
            db_path: PathBuf::from("medtrace.db"),
            model_path: PathBuf::from(crate::model::DEFAULT_MODEL_PATH),
            ledger_url: "http://127.0.0.1:5551/api/v1".to_string(),
            notify_url: "http://127.0.0.1:5552/api/v1".to_string(),
            qr_secret: String::new(),
            rate_limit_rpm: 60,
            access_log_path: "medtrace-access.jsonl".to_string(),
            max_access_log_bytes: 50 * 1024 * 1024, // 50 MB
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("model_path", &self.model_path)
            .field("ledger_url", &self.ledger_url)
            .field("notify_url", &self.notify_url)
            .field("qr_secret", &"[REDACTED]")
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("access_log_path", &self.access_log_path)
            .field("max_access_log_bytes", &self.max_access_log_bytes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// Query parameters for the unit verification endpoint.
///
/// `lat`/`long` arrive as strings and are parsed leniently: a malformed
/// float is recorded as absent, never a request error.
#[derive(Debug, Default, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub sig: Option<String>,
    #[serde(default)]
    pub lat: Option<String>,
    #[serde(default)]
    pub long: Option<String>,
}

/// Risk classifier output included in the verification response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskView {
    pub label: i64,
    pub probability: f32,
}

/// Successful verification response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
    pub unit: UnitRecord,
    pub batch: BatchRecord,
    pub authenticity_result_check: AuthenticityVerdict,
    pub risk: RiskView,
}

/// Error payload for every failure class.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub valid: bool,
    pub error: String,
    /// Diagnostic detail for the fatal inference-failure path only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_error: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: error.into(),
            inference_error: None,
        }
    }

    pub fn inference(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: error.into(),
            inference_error: Some(detail.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Artifact hash, present once the model has been loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_hash: Option<String>,
    pub uptime_seconds: u64,
    pub db_ok: bool,
}

/// Stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub requests: RequestStats,
    pub verdicts: VerdictStats,
    pub endpoints: EndpointStats,
    pub predictions_scored: u64,
    pub notifications: NotificationStats,
}

#[derive(Debug, Serialize)]
pub struct RequestStats {
    pub total: u64,
    pub errors: u64,
}

#[derive(Debug, Serialize)]
pub struct VerdictStats {
    pub genuine: u64,
    pub suspicious: u64,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub verify: u64,
    pub health: u64,
    pub stats: u64,
}

#[derive(Debug, Serialize)]
pub struct NotificationStats {
    pub sent: u64,
    pub failed: u64,
}
