use crate::adapter::{DeltaStream, StreamItem};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Error injected into the outbound body so the client sees an aborted
/// response instead of a clean EOF.
#[derive(Debug, thiserror::Error)]
#[error("stream aborted: {0}")]
pub struct StreamAbort(pub String);

/// Per-request timing and accumulation, owned by the pump loop. `first_token_at`
/// is set at most once, on the first non-empty delta; `ended_at` exactly once,
/// at the terminal transition.
#[derive(Debug)]
pub struct StreamState {
    pub started_at: DateTime<Utc>,
    pub first_token_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub text: String,
}

impl StreamState {
    /// Marks request acceptance.
    pub fn begin() -> Self {
        Self {
            started_at: Utc::now(),
            first_token_at: None,
            ended_at: None,
            text: String::new(),
        }
    }

    fn record_delta(&mut self, text: &str) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Utc::now());
        }
        self.text.push_str(text);
    }

    pub fn finish(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }
}

/// Terminal disposition of one request's stream. Exactly one of these is
/// reached, and finalization runs once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal marker seen, outbound channel closed cleanly.
    Closed,
    /// Adapter failed mid-iteration; the outbound body was aborted.
    Errored(String),
    /// The client stopped reading; no further deltas were pulled.
    Truncated,
}

/// Drives one adapter sequence into the outbound byte channel: each non-empty
/// delta is encoded and sent exactly once, in arrival order, with the bounded
/// channel providing backpressure. Empty deltas are pulled past without
/// emission.
pub async fn pump(
    mut deltas: DeltaStream,
    tx: mpsc::Sender<Result<Bytes, StreamAbort>>,
    state: &mut StreamState,
) -> Outcome {
    loop {
        match deltas.next_item().await {
            None | Some(Ok(StreamItem::Done)) => {
                state.finish();
                return Outcome::Closed;
            }
            Some(Ok(StreamItem::Delta(text))) => {
                if text.is_empty() {
                    continue;
                }
                state.record_delta(&text);
                if tx.send(Ok(Bytes::from(text))).await.is_err() {
                    state.finish();
                    return Outcome::Truncated;
                }
            }
            Some(Err(err)) => {
                state.finish();
                let _ = tx.send(Err(StreamAbort(err.message.clone()))).await;
                return Outcome::Errored(err.message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{BoxError, SseEvents};
    use eventsource_stream::Eventsource;
    use futures_util::StreamExt;
    use serde_json::json;

    fn sse_from_lines(lines: Vec<Result<String, BoxError>>) -> SseEvents {
        futures_util::stream::iter(
            lines
                .into_iter()
                .map(|item| item.map(|data| Bytes::from(format!("data: {data}\n\n")))),
        )
        .boxed()
        .eventsource()
    }

    fn chat_chunk(content: &str, finish: Option<&str>) -> String {
        json!({
            "choices": [{
                "delta": if content.is_empty() { json!({}) } else { json!({ "content": content }) },
                "finish_reason": finish,
            }]
        })
        .to_string()
    }

    async fn drain(mut rx: mpsc::Receiver<Result<Bytes, StreamAbort>>) -> (String, bool) {
        let mut out = String::new();
        let mut aborted = false;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(bytes) => out.push_str(std::str::from_utf8(&bytes).unwrap()),
                Err(_) => aborted = true,
            }
        }
        (out, aborted)
    }

    #[tokio::test]
    async fn forwards_deltas_in_order_and_closes() {
        let deltas = DeltaStream::ChatCompletion {
            events: sse_from_lines(vec![
                Ok(chat_chunk("He", None)),
                Ok(chat_chunk("llo", None)),
                Ok(chat_chunk("", Some("stop"))),
                Ok("[DONE]".to_string()),
            ]),
            pending_done: false,
            done: false,
        };
        let (tx, rx) = mpsc::channel(16);
        let mut state = StreamState::begin();
        let outcome = pump(deltas, tx, &mut state).await;

        assert_eq!(outcome, Outcome::Closed);
        assert_eq!(state.text, "Hello");
        assert!(state.first_token_at.is_some());
        assert!(state.ended_at.is_some());
        let (body, aborted) = drain(rx).await;
        assert_eq!(body, "Hello");
        assert!(!aborted);
    }

    #[tokio::test]
    async fn trailing_content_on_finish_chunk_is_emitted() {
        let deltas = DeltaStream::ChatCompletion {
            events: sse_from_lines(vec![Ok(chat_chunk("tail", Some("stop")))]),
            pending_done: false,
            done: false,
        };
        let (tx, rx) = mpsc::channel(16);
        let mut state = StreamState::begin();
        let outcome = pump(deltas, tx, &mut state).await;

        assert_eq!(outcome, Outcome::Closed);
        let (body, aborted) = drain(rx).await;
        assert_eq!(body, "tail");
        assert!(!aborted);
    }

    #[tokio::test]
    async fn transport_error_aborts_outbound_channel() {
        let io_err: BoxError = Box::new(std::io::Error::other("connection reset"));
        let deltas = DeltaStream::ChatCompletion {
            events: sse_from_lines(vec![Ok(chat_chunk("partial", None)), Err(io_err)]),
            pending_done: false,
            done: false,
        };
        let (tx, rx) = mpsc::channel(16);
        let mut state = StreamState::begin();
        let outcome = pump(deltas, tx, &mut state).await;

        assert!(matches!(outcome, Outcome::Errored(_)));
        assert_eq!(state.text, "partial");
        assert!(state.ended_at.is_some());
        let (body, aborted) = drain(rx).await;
        assert_eq!(body, "partial");
        assert!(aborted);
    }

    #[tokio::test]
    async fn client_disconnect_truncates_without_further_pulls() {
        let deltas = DeltaStream::ChatCompletion {
            events: sse_from_lines(vec![
                Ok(chat_chunk("He", None)),
                Ok(chat_chunk("llo", None)),
                Ok("[DONE]".to_string()),
            ]),
            pending_done: false,
            done: false,
        };
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut state = StreamState::begin();
        let outcome = pump(deltas, tx, &mut state).await;

        assert_eq!(outcome, Outcome::Truncated);
        // The first delta was pulled and recorded before the send failed.
        assert_eq!(state.text, "He");
        assert!(state.ended_at.is_some());
    }

    #[tokio::test]
    async fn gemini_extraction_failure_does_not_terminate() {
        let safety = json!({ "promptFeedback": { "blockReason": "SAFETY" } }).to_string();
        let text = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Bonjour" }] } }]
        })
        .to_string();
        let deltas = DeltaStream::Gemini {
            events: sse_from_lines(vec![Ok(safety), Ok(text)]),
            done: false,
        };
        let (tx, rx) = mpsc::channel(16);
        let mut state = StreamState::begin();
        let outcome = pump(deltas, tx, &mut state).await;

        assert_eq!(outcome, Outcome::Closed);
        let (body, aborted) = drain(rx).await;
        assert_eq!(body, "Bonjour");
        assert!(!aborted);
    }

    #[tokio::test]
    async fn zero_delta_stream_closes_with_empty_text() {
        let deltas = DeltaStream::Gemini {
            events: sse_from_lines(vec![]),
            done: false,
        };
        let (tx, rx) = mpsc::channel(16);
        let mut state = StreamState::begin();
        let outcome = pump(deltas, tx, &mut state).await;

        assert_eq!(outcome, Outcome::Closed);
        assert!(state.first_token_at.is_none());
        assert_eq!(state.text, "");
        let (body, aborted) = drain(rx).await;
        assert_eq!(body, "");
        assert!(!aborted);
    }
}
