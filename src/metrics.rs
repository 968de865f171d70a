use crate::stream::StreamState;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Timing snapshot derived once per request when the stream reaches a terminal
/// state. Timestamps are epoch milliseconds; `token_count` is the character
/// count of the accumulated text, a documented approximation rather than a
/// true token count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRecord {
    pub start_time: i64,
    pub first_token_time: Option<i64>,
    pub end_time: i64,
    pub total_time: i64,
    pub first_token_latency: Option<i64>,
    pub generation_time: Option<i64>,
    pub token_count: u64,
    pub tokens_per_second: Option<u64>,
}

/// Pure derivation from the observed timestamps. Tolerates streams that never
/// produced a non-empty delta: everything besides the total duration is absent.
pub fn finalize(state: &StreamState) -> MetricsRecord {
    let start = state.started_at.timestamp_millis();
    let end = state
        .ended_at
        .unwrap_or_else(Utc::now)
        .timestamp_millis();
    let first = state.first_token_at.map(|t| t.timestamp_millis());

    let total_time = end - start;
    let first_token_latency = first.map(|f| f - start);
    let generation_time = first.map(|f| end - f);
    let token_count = state.text.chars().count() as u64;
    let tokens_per_second = generation_time
        .filter(|g| *g > 0)
        .map(|g| (token_count as f64 / (g as f64 / 1000.0)).round() as u64);

    MetricsRecord {
        start_time: start,
        first_token_time: first,
        end_time: end,
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
    use chrono::{DateTime, TimeZone, Utc};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn state(start: i64, first: Option<i64>, end: i64, text: &str) -> StreamState {
        StreamState {
            started_at: at(start),
            first_token_at: first.map(at),
            ended_at: Some(at(end)),
            text: text.to_string(),
        }
    }

    #[test]
    fn derives_latency_and_throughput() {
        let record = finalize(&state(1_000, Some(1_250), 2_000, "Hello"));
        assert_eq!(record.total_time, 1_000);
        assert_eq!(record.first_token_latency, Some(250));
        assert_eq!(record.generation_time, Some(750));
        assert_eq!(record.token_count, 5);
        // round(5 / 0.75)
        assert_eq!(record.tokens_per_second, Some(7));
    }

    #[test]
    fn generation_time_complements_latency_exactly() {
        let record = finalize(&state(10, Some(400), 12_345, "x"));
        assert_eq!(
            record.generation_time.unwrap(),
            record.total_time - record.first_token_latency.unwrap()
        );
        assert!(record.first_token_latency.unwrap() >= 0);
        assert!(record.first_token_latency.unwrap() <= record.total_time);
    }

    #[test]
    fn zero_deltas_leave_derived_fields_absent() {
        let record = finalize(&state(1_000, None, 1_400, ""));
        assert_eq!(record.total_time, 400);
        assert_eq!(record.first_token_time, None);
        assert_eq!(record.first_token_latency, None);
        assert_eq!(record.generation_time, None);
        assert_eq!(record.tokens_per_second, None);
        assert_eq!(record.token_count, 0);
    }

    #[test]
    fn zero_generation_time_omits_throughput() {
        let record = finalize(&state(1_000, Some(1_400), 1_400, "ab"));
        assert_eq!(record.generation_time, Some(0));
        assert_eq!(record.tokens_per_second, None);
    }

    #[test]
    fn serializes_camel_case_with_nulls() {
        let value = serde_json::to_value(finalize(&state(0, None, 5, ""))).unwrap();
        assert_eq!(value["totalTime"], 5);
        assert!(value["firstTokenLatency"].is_null());
        assert!(value["tokensPerSecond"].is_null());
        assert_eq!(value["tokenCount"], 0);
    }
}
