use axum::http::HeaderMap;
use chrono::{DateTime, Utc};

/// Token counts extracted from a Messages API response body.
///
/// Absent counters default to zero; `model` stays `None` when the upstream
/// never reported one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCounts {
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
}

/// A fully materialized exchange, ready to be persisted.
///
/// Bodies hold decoded UTF-8 text (decompressed when the wire bytes were
/// gzipped), already capped by [`truncate_body`]. `request_body` is `None`
/// when the client sent no body at all.
#[derive(Debug, Clone)]
pub struct NewExchange {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub request_headers: serde_json::Value,
    pub request_body: Option<String>,
    pub response_status: i32,
    pub response_headers: serde_json::Value,
    pub response_body: String,
    pub duration_ms: i64,
    pub token_usage: Option<TokenCounts>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredExchange {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
}

/// Per-exchange projection consumed by the stats aggregator.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatsProjection {
    pub timestamp: DateTime<Utc>,
    pub has_llm: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Encode headers for recording: lower-cased name mapped to its values
/// joined with `", "`. Lossy for duplicate-name ordering, which is fine for
/// an observability column; the wire path never goes through this.
pub fn headers_to_json(headers: &HeaderMap) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        out.insert(name.as_str().to_owned(), serde_json::Value::String(joined));
    }

    serde_json::Value::Object(out)
}

/// Cap a recorded body at `cap` bytes, keeping the longest valid UTF-8
/// prefix and appending a trailer that names the original and kept sizes.
/// Bodies at or under the cap are stored unchanged.
pub fn truncate_body(text: String, cap: usize) -> String {
    let original = text.len();
    if original <= cap {
        return text;
    }

    let mut kept = cap;
    while kept > 0 && !text.is_char_boundary(kept) {
        kept -= 1;
    }

    format!(
        "{}\n[TRUNCATED: original size was {original} bytes, stored first {kept} bytes]",
        &text[..kept]
    )
}
