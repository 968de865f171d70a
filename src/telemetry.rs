use crate::metrics::MetricsRecord;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// One finished request, serialized as a single JSON line. Immutable once
/// constructed and handed to the sink exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub model: String,
    pub prompt: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    pub metrics: MetricsRecord,
}

impl LogEntry {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, metrics: MetricsRecord) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            model: model.into(),
            prompt: prompt.into(),
            response: String::new(),
            error: None,
            truncated: None,
            metrics,
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn mark_truncated(mut self) -> Self {
        self.truncated = Some(true);
        self
    }
}

/// Best-effort append-only store, one file per calendar day. Failures never
/// reach the request path.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    log_dir: PathBuf,
}

impl TelemetrySink {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    fn day_file(&self) -> PathBuf {
        self.log_dir
            .join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")))
    }

    pub async fn log(&self, entry: &LogEntry) -> Result<(), String> {
        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|err| format!("log_dir_create_failed: {err}"))?;
        let mut line = serde_json::to_string(entry)
            .map_err(|err| format!("log_serialize_failed: {err}"))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.day_file())
            .await
            .map_err(|err| format!("log_open_failed: {err}"))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| format!("log_write_failed: {err}"))?;
        Ok(())
    }

    /// Fire-and-forget: submitted after the stream decision is final, never
    /// retried. On failure the entry is dumped to the operational log instead.
    pub fn spawn_log(&self, entry: LogEntry) {
        let sink = self.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.log(&entry).await {
                tracing::warn!("failed to write telemetry entry: {err}");
                if let Ok(line) = serde_json::to_string(&entry) {
                    tracing::info!(entry = %line, "telemetry entry dropped to console");
                }
            }
        });
    }
}
