use crate::adapter::{self, StreamRequest, UpstreamCallError, UpstreamErrorKind};
use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::metrics::{self, MetricsRecord};
use crate::stream::{self, Outcome, StreamAbort, StreamState};
use crate::telemetry::LogEntry;
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Streaming completion endpoint. Validation failures are rejected before any
/// adapter is constructed; once streaming begins, failures abort the body and
/// are visible only in the telemetry log.
pub async fn create_chat(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let mut stream_state = StreamState::begin();

    let prompt = extract_prompt(&body);
    if prompt.trim().is_empty() {
        return Err(AppError::bad_request("empty_prompt", "prompt must not be empty"));
    }

    let platform_id = body
        .get("platform")
        .and_then(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| state.platforms.default_platform());
    let Some(platform) = state.platforms.get(platform_id) else {
        return Err(AppError::bad_request(
            "unknown_platform",
            format!("unsupported platform: {platform_id}"),
        ));
    };
    let Some(api_key) = platform.api_key() else {
        return Err(AppError::unauthorized(
            "missing_api_key",
            format!("missing API key for platform: {}", platform.name),
        ));
    };
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| platform.default_model())
        .to_string();

    let request = StreamRequest {
        platform,
        api_key: &api_key,
        model: &model,
        prompt: &prompt,
    };
    let deltas = match adapter::open_stream(
        &state.http,
        &request,
        state.runtime.upstream_timeout_ms,
    )
    .await
    {
        Ok(deltas) => deltas,
        Err(err) => {
            tracing::warn!(platform = %platform.id, model = %model, "upstream call failed: {}", err.message);
            stream_state.finish();
            let record = metrics::finalize(&stream_state);
            state.sink.spawn_log(
                LogEntry::new(model.as_str(), prompt.as_str(), record)
                    .with_error(err.message.as_str()),
            );
            return Err(upstream_error_to_app(err));
        }
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, StreamAbort>>(64);
    let sink = state.sink.clone();
    let platform_id = platform.id.clone();
    tokio::spawn(async move {
        let outcome = stream::pump(deltas, tx, &mut stream_state).await;
        let record = metrics::finalize(&stream_state);
        let entry = LogEntry::new(model.as_str(), prompt.as_str(), record)
            .with_response(stream_state.text.as_str());
        let entry = match &outcome {
            Outcome::Closed => entry,
            Outcome::Errored(message) => {
                tracing::warn!(platform = %platform_id, model = %model, "stream aborted: {message}");
                entry.with_error(message.as_str())
            }
            Outcome::Truncated => {
                tracing::debug!(platform = %platform_id, model = %model, "client disconnected mid-stream");
                entry.mark_truncated()
            }
        };
        sink.spawn_log(entry);
    });

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx)),
    )
        .into_response())
}

fn extract_prompt(body: &Value) -> String {
    if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
        if let Some(last) = messages.last() {
            if last.get("role").and_then(|v| v.as_str()) == Some("user") {
                if let Some(content) = last.get("content") {
                    return content
                        .as_str()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| content.to_string());
                }
            }
        }
        return String::new();
    }
    body.get("prompt")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    match err.kind {
        UpstreamErrorKind::Network => AppError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_unreachable",
            err.message,
        ),
        UpstreamErrorKind::Http => AppError::new(
            err.status.unwrap_or(StatusCode::BAD_GATEWAY),
            "upstream_error",
            err.message,
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLogRequest {
    pub test_id: String,
    pub prompt_template: String,
    #[serde(default)]
    pub variables: Vec<String>,
    pub model: String,
    pub platform: String,
    pub results: Vec<BatchResult>,
    pub timestamp: String,
    pub duration: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub id: String,
    #[serde(default)]
    pub variable: String,
    pub prompt: String,
    #[serde(default)]
    pub response: String,
    pub model: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub start_time: i64,
    #[serde(default)]
    pub first_token_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// Replays pre-computed batch results through the telemetry sink: one aggregate
/// entry for the batch, then one per finished result.
pub async fn log_batch(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let batch: BatchLogRequest = match serde_json::from_value(body) {
        Ok(batch) => batch,
        Err(err) => {
            tracing::warn!("failed to parse batch log request: {err}");
            return batch_failure();
        }
    };

    for entry in batch_entries(&batch) {
        if let Err(err) = state.sink.log(&entry).await {
            tracing::warn!(test_id = %batch.test_id, "failed to log batch results: {err}");
            return batch_failure();
        }
    }
    Json(json!({ "success": true })).into_response()
}

fn batch_failure() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": "failed to log batch results" })),
    )
        .into_response()
}

fn batch_entries(batch: &BatchLogRequest) -> Vec<LogEntry> {
    let now = Utc::now().timestamp_millis();
    let batch_start = DateTime::parse_from_rfc3339(&batch.timestamp)
        .map(|t| t.timestamp_millis())
        .unwrap_or(now);
    let summed_chars: u64 = batch
        .results
        .iter()
        .map(|r| r.response.chars().count() as u64)
        .sum();

    let mut entries = vec![
        LogEntry::new(
            batch.model.as_str(),
            format!("Batch Test: {}", batch.prompt_template),
            MetricsRecord {
                start_time: batch_start,
                first_token_time: None,
                end_time: now,
                total_time: batch.duration,
                first_token_latency: None,
                generation_time: None,
                token_count: summed_chars,
                tokens_per_second: Some(0),
            },
        )
        .with_response(format!("Batch completed with {} tests", batch.results.len())),
    ];

    for result in &batch.results {
        match result.status {
            BatchStatus::Completed => {
                let Some(end_time) = result.end_time else {
                    continue;
                };
                entries.push(
                    LogEntry::new(
                        result.model.as_str(),
                        result.prompt.as_str(),
                        result_metrics(result, end_time),
                    )
                    .with_response(result.response.as_str()),
                );
            }
            BatchStatus::Error => {
                let end_time = result.end_time.unwrap_or(now);
                entries.push(
                    LogEntry::new(
                        result.model.as_str(),
                        result.prompt.as_str(),
                        MetricsRecord {
                            start_time: result.start_time,
                            first_token_time: None,
                            end_time,
                            total_time: end_time - result.start_time,
                            first_token_latency: None,
                            generation_time: None,
                            token_count: 0,
                            tokens_per_second: None,
                        },
                    )
                    .with_error(result.error.as_deref().unwrap_or("Unknown error")),
                );
            }
            BatchStatus::Pending | BatchStatus::Running => {}
        }
    }
    entries
}

fn result_metrics(result: &BatchResult, end_time: i64) -> MetricsRecord {
    let total_time = end_time - result.start_time;
    let first_token_latency = result.first_token_time.map(|f| f - result.start_time);
    let generation_time = result.first_token_time.map(|f| end_time - f);
    let token_count = result.response.chars().count() as u64;
    let tokens_per_second = generation_time
        .filter(|g| *g > 0)
        .map(|g| (token_count as f64 / (g as f64 / 1000.0)).round() as u64);
    MetricsRecord {
        start_time: result.start_time,
        first_token_time: result.first_token_time,
        end_time,
        total_time,
        first_token_latency,
        generation_time,
        token_count,
        tokens_per_second,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_taken_from_last_user_message() {
        let body = json!({
            "messages": [
                { "role": "user", "content": "first" },
                { "role": "assistant", "content": "reply" },
                { "role": "user", "content": "second" }
            ]
        });
        assert_eq!(extract_prompt(&body), "second");
    }

    #[test]
    fn messages_ending_with_assistant_yield_no_prompt() {
        let body = json!({
            "messages": [
                { "role": "user", "content": "question" },
                { "role": "assistant", "content": "answer" }
            ]
        });
        assert_eq!(extract_prompt(&body), "");
    }

    #[test]
    fn plain_prompt_field_used_without_messages() {
        assert_eq!(extract_prompt(&json!({ "prompt": "Hello" })), "Hello");
        assert_eq!(extract_prompt(&json!({})), "");
    }

    #[test]
    fn batch_entries_cover_summary_and_results() {
        let batch: BatchLogRequest = serde_json::from_value(json!({
            "testId": "t1",
            "promptTemplate": "Say {x}",
            "variables": ["a", "b"],
            "model": "qwen-flash",
            "platform": "dashscope",
            "timestamp": "2026-08-30T00:00:00Z",
            "duration": 1500,
            "results": [
                {
                    "id": "r1",
                    "variable": "a",
                    "prompt": "Say a",
                    "response": "aaaa",
                    "model": "qwen-flash",
                    "status": "completed",
                    "startTime": 1000,
                    "firstTokenTime": 1200,
                    "endTime": 2000
                },
                {
                    "id": "r2",
                    "variable": "b",
                    "prompt": "Say b",
                    "model": "qwen-flash",
                    "status": "error",
                    "error": "boom",
                    "startTime": 1000,
                    "endTime": 1100
                },
                {
                    "id": "r3",
                    "variable": "c",
                    "prompt": "Say c",
                    "model": "qwen-flash",
                    "status": "running",
                    "startTime": 1000
                }
            ]
        }))
        .unwrap();

        let entries = batch_entries(&batch);
        assert_eq!(entries.len(), 3);

        assert!(entries[0].prompt.starts_with("Batch Test:"));
        assert_eq!(entries[0].metrics.total_time, 1500);
        assert_eq!(entries[0].metrics.token_count, 4);

        assert_eq!(entries[1].metrics.total_time, 1000);
        assert_eq!(entries[1].metrics.first_token_latency, Some(200));
        assert_eq!(entries[1].metrics.generation_time, Some(800));
        // round(4 / 0.8)
        assert_eq!(entries[1].metrics.tokens_per_second, Some(5));

        assert_eq!(entries[2].error.as_deref(), Some("boom"));
        assert_eq!(entries[2].metrics.token_count, 0);
        assert_eq!(entries[2].metrics.tokens_per_second, None);
    }
}
