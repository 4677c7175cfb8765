//! Usage metrics and JSONL access logging.

use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::store::ScanResult;

/// Maximum number of rotated access log files to keep.
const MAX_ACCESS_LOG_ROTATIONS: usize = 5;

/// One access-log line, written after a completed verification.
pub struct ScanLogEntry<'a> {
    pub serial_number: &'a str,
    pub scan_result: &'a str,
    pub valid: bool,
    pub scan_id: i64,
    pub processing_time_ms: u64,
}

pub struct UsageMetrics {
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,

    pub genuine: AtomicU64,
    pub suspicious: AtomicU64,

    pub ep_verify: AtomicU64,
    pub ep_health: AtomicU64,
    pub ep_stats: AtomicU64,

    pub predictions_scored: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,

    access_log: std::sync::Mutex<Option<File>>,
    access_log_path: String,
    access_log_bytes: AtomicU64,
    max_access_log_bytes: u64,
}

impl UsageMetrics {
    pub fn new(access_log_path: &str, max_access_log_bytes: u64) -> Self {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(access_log_path)
            .ok();
        if file.is_none() {
            warn!(path = access_log_path, "could not open access log");
        }
        let current_size = std::fs::metadata(access_log_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            genuine: AtomicU64::new(0),
            suspicious: AtomicU64::new(0),
            ep_verify: AtomicU64::new(0),
            ep_health: AtomicU64::new(0),
            ep_stats: AtomicU64::new(0),
            predictions_scored: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            access_log: std::sync::Mutex::new(file),
            access_log_path: access_log_path.to_string(),
            access_log_bytes: AtomicU64::new(current_size),
            max_access_log_bytes,
        }
    }

    /// Record a completed verification and append its access-log line.
    pub fn record(&self, result: ScanResult, entry: &ScanLogEntry<'_>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match result {
            ScanResult::Genuine => {
                self.genuine.fetch_add(1, Ordering::Relaxed);
            }
            ScanResult::Suspicious => {
                self.suspicious.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Ok(mut guard) = self.access_log.try_lock() {
            if let Some(ref mut file) = *guard {
                let line_json = serde_json::json!({
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "serial_number": entry.serial_number,
                    "scan_result": entry.scan_result,
                    "valid": entry.valid,
                    "scan_id": entry.scan_id,
                    "processing_time_ms": entry.processing_time_ms,
                });
                let mut line = line_json.to_string();
                line.push('\n');
                let line_len = line.len() as u64;
                if let Err(e) = file.write_all(line.as_bytes()) {
                    warn!(error = %e, "failed to write access log entry");
                }
                let new_size =
                    self.access_log_bytes.fetch_add(line_len, Ordering::Relaxed) + line_len;

                // Rotate if over size limit (0 = no limit)
                if self.max_access_log_bytes > 0 && new_size >= self.max_access_log_bytes {
                    for i in (1..MAX_ACCESS_LOG_ROTATIONS).rev() {
                        let from = format!("{}.{}", self.access_log_path, i);
                        let to = format!("{}.{}", self.access_log_path, i + 1);
                        if from != to {
                            let _ = std::fs::rename(&from, &to);
                        }
                    }
                    let rotated = format!("{}.1", self.access_log_path);
                    if let Err(e) = std::fs::rename(&self.access_log_path, &rotated) {
                        warn!(from = %self.access_log_path, to = %rotated, error = %e, "log rotation rename failed");
                    }
                    if let Ok(new_file) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&self.access_log_path)
                    {
                        *file = new_file;
                        self.access_log_bytes.store(0, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    pub fn record_error(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fan_out(&self, report: &crate::notify::FanOutReport) {
        self.notifications_sent
            .fetch_add(u64::from(report.delivered), Ordering::Relaxed);
        self.notifications_failed.fetch_add(
            u64::from(report.attempted - report.delivered),
            Ordering::Relaxed,
        );
    }
}
