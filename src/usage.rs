//! Token-usage extraction from Anthropic Messages API responses.
//!
//! Pure functions over recorded body text; malformed or partial payloads
//! always degrade to `None`, never to an error.

use serde_json::Value;

use crate::domain::TokenCounts;

/// Whether a proxied request was an Anthropic Messages call: POST to a path
/// whose final segment (query string aside) is `messages`. Matches
/// `/v1/messages`, `/v1/messages?stream=true` and `/prefix/v1/messages`,
/// rejects `/v1/messages-extended` and non-POST methods.
pub fn is_messages_call(method: &str, path: &str) -> bool {
    if !method.eq_ignore_ascii_case("POST") {
        return false;
    }
    let path = path.split('?').next().unwrap_or(path);
    path.to_ascii_lowercase().ends_with("/messages")
}

/// Extract token counts from a response body. `streaming` selects the SSE
/// scan over the plain JSON parse and is derived from the recorded
/// `Content-Type` by the caller.
pub fn parse_usage(body: &str, streaming: bool) -> Option<TokenCounts> {
    if body.trim().is_empty() {
        return None;
    }
    if streaming {
        parse_sse(body)
    } else {
        parse_json(body)
    }
}

fn parse_json(body: &str) -> Option<TokenCounts> {
    let root: Value = serde_json::from_str(body).ok()?;
    let usage = root.get("usage")?;
    let model = root.get("model").and_then(Value::as_str).map(str::to_owned);
    Some(counts_from_usage(usage, model))
}

/// Scan an SSE stream for `message_start` / `message_delta` events. The
/// `message_delta` usage wins when present, with the model backfilled from
/// whatever the stream reported last (normally `message_start`).
fn parse_sse(body: &str) -> Option<TokenCounts> {
    let mut model: Option<String> = None;
    let mut start: Option<TokenCounts> = None;
    let mut delta: Option<TokenCounts> = None;

    for line in body.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            continue;
        };

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let Some(message) = event.get("message") else {
                    continue;
                };
                if let Some(name) = message.get("model").and_then(Value::as_str) {
                    model = Some(name.to_owned());
                }
                if let Some(usage) = message.get("usage") {
                    start = Some(counts_from_usage(usage, model.clone()));
                }
            }
            Some("message_delta") => {
                if let Some(usage) = event.get("usage") {
                    delta = Some(counts_from_usage(usage, None));
                }
            }
            _ => {}
        }
    }

    match delta {
        Some(mut counts) => {
            counts.model = model;
            Some(counts)
        }
        None => start,
    }
}

fn counts_from_usage(usage: &Value, model: Option<String>) -> TokenCounts {
    TokenCounts {
        model,
        input_tokens: int_field(usage, "input_tokens"),
        output_tokens: int_field(usage, "output_tokens"),
        cache_read_tokens: int_field(usage, "cache_read_input_tokens"),
        cache_creation_tokens: int_field(usage, "cache_creation_input_tokens"),
    }
}

fn int_field(usage: &Value, key: &str) -> i64 {
    usage.get(key).and_then(Value::as_i64).unwrap_or(0)
}
