use crate::platforms::{PlatformConfig, PlatformKind};
use axum::http::StatusCode;
use bytes::Bytes;
use eventsource_stream::{EventStream, Eventsource};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }
}

/// One pulled element of a provider stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// Incremental text fragment. May be empty (e.g. a safety-filtered Gemini
    /// chunk); empty fragments are pulled past, never forwarded.
    Delta(String),
    /// No more deltas will be produced. Yielded exactly once.
    Done,
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type SseEvents = EventStream<BoxStream<'static, Result<Bytes, BoxError>>>;

pub struct StreamRequest<'a> {
    pub platform: &'a PlatformConfig,
    pub api_key: &'a str,
    pub model: &'a str,
    pub prompt: &'a str,
}

/// Lazy, finite, non-restartable sequence of [`StreamItem`]s over one upstream
/// call. A closed set of provider dialects; each hides its own chunk shapes and
/// termination quirks behind [`DeltaStream::next_item`].
pub enum DeltaStream {
    ChatCompletion {
        events: SseEvents,
        /// Set when a chunk carried both content and a finish reason; the
        /// content is yielded first and `Done` on the following pull.
        pending_done: bool,
        done: bool,
    },
    Gemini {
        events: SseEvents,
        done: bool,
    },
}

/// Issues the provider-specific streaming call and returns the unified delta
/// sequence. Fails before the first delta on connect errors or a non-2xx
/// upstream status.
pub async fn open_stream(
    client: &reqwest::Client,
    request: &StreamRequest<'_>,
    timeout_ms: u64,
) -> Result<DeltaStream, UpstreamCallError> {
    let base = request.platform.base_url.trim_end_matches('/');
    let builder = match request.platform.kind {
        PlatformKind::ChatCompletion => {
            let body = json!({
                "model": request.model,
                "messages": [{ "role": "user", "content": request.prompt }],
                "stream": true,
                "temperature": 0.7,
            });
            client
                .post(format!("{base}/chat/completions"))
                .bearer_auth(request.api_key)
                .json(&body)
        }
        PlatformKind::Gemini => {
            // Raw prompt as a single content part, no chat role wrapper.
            let body = json!({
                "contents": [{ "parts": [{ "text": request.prompt }] }],
            });
            client
                .post(format!(
                    "{base}/models/{}:streamGenerateContent",
                    request.model
                ))
                .query(&[("alt", "sse")])
                .header("x-goog-api-key", request.api_key)
                .json(&body)
        }
    };

    let resp = builder
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .send()
        .await
        .map_err(|err| {
            UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string())
        })?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {status}: {text}"),
        ));
    }

    let events = resp
        .bytes_stream()
        .map_err(|err| Box::new(err) as BoxError)
        .boxed()
        .eventsource();
    Ok(match request.platform.kind {
        PlatformKind::ChatCompletion => DeltaStream::ChatCompletion {
            events,
            pending_done: false,
            done: false,
        },
        PlatformKind::Gemini => DeltaStream::Gemini {
            events,
            done: false,
        },
    })
}

impl DeltaStream {
    /// Pulls the next item. Returns `None` only after `Done` or an error has
    /// been yielded; a transport failure mid-iteration surfaces as `Err`, never
    /// as silent completion.
    pub async fn next_item(&mut self) -> Option<Result<StreamItem, UpstreamCallError>> {
        match self {
            DeltaStream::ChatCompletion {
                events,
                pending_done,
                done,
            } => {
                if *done {
                    return None;
                }
                if *pending_done {
                    *done = true;
                    return Some(Ok(StreamItem::Done));
                }
                loop {
                    match events.next().await {
                        None => {
                            // Upstream closed without a finish reason; treat as terminal.
                            *done = true;
                            return Some(Ok(StreamItem::Done));
                        }
                        Some(Err(err)) => {
                            *done = true;
                            return Some(Err(UpstreamCallError::new(
                                UpstreamErrorKind::Network,
                                None,
                                err.to_string(),
                            )));
                        }
                        Some(Ok(ev)) => match parse_chat_event(&ev.data) {
                            ChatEvent::Skip => continue,
                            ChatEvent::Delta(text) => {
                                return Some(Ok(StreamItem::Delta(text)));
                            }
                            ChatEvent::DeltaThenDone(text) => {
                                *pending_done = true;
                                return Some(Ok(StreamItem::Delta(text)));
                            }
                            ChatEvent::Done => {
                                *done = true;
                                return Some(Ok(StreamItem::Done));
                            }
                        },
                    }
                }
            }
            DeltaStream::Gemini { events, done } => {
                if *done {
                    return None;
                }
                match events.next().await {
                    None => {
                        // Gemini never sends an explicit finish chunk; synthesize one.
                        *done = true;
                        Some(Ok(StreamItem::Done))
                    }
                    Some(Err(err)) => {
                        *done = true;
                        Some(Err(UpstreamCallError::new(
                            UpstreamErrorKind::Network,
                            None,
                            err.to_string(),
                        )))
                    }
                    Some(Ok(ev)) => {
                        let value: Value = serde_json::from_str(&ev.data).unwrap_or(Value::Null);
                        // Extraction failure (safety filter, foreign shape) is an
                        // empty delta; the stream continues.
                        let text = extract_gemini_text(&value).unwrap_or_default();
                        Some(Ok(StreamItem::Delta(text)))
                    }
                }
            }
        }
    }
}

enum ChatEvent {
    Skip,
    Delta(String),
    DeltaThenDone(String),
    Done,
}

fn parse_chat_event(data: &str) -> ChatEvent {
    if data.trim() == "[DONE]" {
        return ChatEvent::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return ChatEvent::Skip;
    };
    let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    else {
        return ChatEvent::Skip;
    };
    let content = choice
        .get("delta")
        .and_then(|v| v.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let finished = choice
        .get("finish_reason")
        .map(|v| !v.is_null())
        .unwrap_or(false);
    match (content.is_empty(), finished) {
        (true, true) => ChatEvent::Done,
        (false, true) => ChatEvent::DeltaThenDone(content.to_string()),
        (true, false) => ChatEvent::Skip,
        (false, false) => ChatEvent::Delta(content.to_string()),
    }
}

/// Explicitly fallible text extraction for a Gemini chunk: concatenated
/// `candidates[0].content.parts[*].text`, thought parts excluded. `None` when
/// the chunk carries no readable text at all.
fn extract_gemini_text(value: &Value) -> Option<String> {
    let parts = value
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("content"))
        .and_then(|v| v.get("parts"))
        .and_then(|v| v.as_array())?;
    let mut out = String::new();
    let mut saw_text = false;
    for part in parts {
        if part.get("thought").and_then(|v| v.as_bool()) == Some(true) {
            continue;
        }
        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
            saw_text = true;
            out.push_str(text);
        }
    }
    saw_text.then_some(out)
}
