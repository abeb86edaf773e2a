//! The terminal proxy handler: forwards every request the router did not
//! claim to the configured upstream, returns the upstream's answer
//! byte-exact, and hands a decoded copy of the exchange to the recorder.

use std::io::{self, Read};
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use tracing::{error, warn};

use crate::{
    api::AppState,
    domain::{self, NewExchange},
    recorder::Recorder,
};

/// Hop-by-hop headers never forwarded upstream. `host` is re-derived from
/// the upstream URL and `content-length` from the re-attached buffered body.
const REQUEST_EXCLUDED_HEADERS: [&str; 11] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "host",
    "content-length",
];

/// Hop-by-hop headers never copied back to the client. `content-length` is
/// recomputed by the server from what is actually written.
const RESPONSE_EXCLUDED_HEADERS: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "content-length",
];

const GATEWAY_TIMEOUT_BODY: &str = "Gateway Timeout: upstream did not respond in time.";
const BAD_GATEWAY_BODY: &str = "Bad Gateway: could not connect to upstream.";

pub async fn forward(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let timestamp = Utc::now();

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| uri.path().to_owned());
    let request_headers = domain::headers_to_json(&headers);

    let target = build_target_url(&state.upstream_base_url, &path_and_query);

    let mut builder = state
        .client
        .request(method.clone(), &target)
        .headers(filtered_headers(&headers, &REQUEST_EXCLUDED_HEADERS));
    if !body.is_empty() {
        builder = builder.body(body.clone());
    }

    // send() resolves once status and headers arrive; the body is read
    // lazily below. A client disconnect drops this future and the request
    // is abandoned without a trace.
    let upstream = match tokio::time::timeout(state.upstream_timeout, builder.send()).await {
        Err(_) => {
            warn!(%target, "upstream did not respond within the configured timeout");
            return (StatusCode::GATEWAY_TIMEOUT, GATEWAY_TIMEOUT_BODY).into_response();
        }
        Ok(Err(err)) if err.is_timeout() => {
            warn!(%target, error = %err, "upstream request timed out");
            return (StatusCode::GATEWAY_TIMEOUT, GATEWAY_TIMEOUT_BODY).into_response();
        }
        Ok(Err(err)) => {
            error!(%target, error = %err, "failed to reach upstream");
            return (StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY).into_response();
        }
        Ok(Ok(response)) => response,
    };

    let status = upstream.status();
    let response_headers = filtered_headers(upstream.headers(), &RESPONSE_EXCLUDED_HEADERS);
    let streaming = is_event_stream(&response_headers);

    let draft = ExchangeDraft {
        timestamp,
        method: method.to_string(),
        path: path_and_query,
        request_headers,
        request_body: body,
        response_status: i32::from(status.as_u16()),
        response_headers: domain::headers_to_json(&response_headers),
        gzipped: content_encoding_is_gzip(&response_headers),
        started,
    };

    let recorder = state.recorder.clone();
    let cap = state.max_stored_body_bytes;

    let response_body = if streaming {
        stream_and_tee(upstream, draft, recorder, cap)
    } else {
        let bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "failed to read upstream response body");
                return (StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY).into_response();
            }
        };
        deliver_and_record(bytes, draft, recorder, cap)
    };

    let mut response = Response::new(response_body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// Forward the upstream body chunk by chunk while accumulating a copy.
/// Recording happens only after the final chunk has been accepted by the
/// client; dropping the stream (client disconnect) or an upstream read
/// error abandons the exchange silently.
fn stream_and_tee(
    upstream: reqwest::Response,
    draft: ExchangeDraft,
    recorder: Recorder,
    cap: usize,
) -> Body {
    let upstream_body = upstream.bytes_stream();

    Body::from_stream(async_stream::stream! {
        tokio::pin!(upstream_body);
        let mut collected = BytesMut::new();
        let mut completed = true;
        while let Some(chunk) = upstream_body.next().await {
            match chunk {
                Ok(chunk) => {
                    collected.extend_from_slice(&chunk);
                    yield Ok::<_, io::Error>(chunk);
                }
                Err(err) => {
                    warn!(error = %err, "upstream stream ended early; exchange not recorded");
                    completed = false;
                    break;
                }
            }
        }
        if completed {
            recorder.record(draft.finish(collected.freeze(), cap));
        }
    })
}

/// Buffered delivery through the same record-on-completion mechanism as the
/// streaming path, so a mid-body client disconnect never records.
fn deliver_and_record(bytes: Bytes, draft: ExchangeDraft, recorder: Recorder, cap: usize) -> Body {
    Body::from_stream(async_stream::stream! {
        if !bytes.is_empty() {
            yield Ok::<_, io::Error>(bytes.clone());
        }
        recorder.record(draft.finish(bytes, cap));
    })
}

/// Everything the forwarder knows about an exchange before the response
/// body has finished; owned by the response-body stream until completion.
struct ExchangeDraft {
    timestamp: DateTime<Utc>,
    method: String,
    path: String,
    request_headers: serde_json::Value,
    request_body: Bytes,
    response_status: i32,
    response_headers: serde_json::Value,
    gzipped: bool,
    started: Instant,
}

impl ExchangeDraft {
    fn finish(self, response_body: Bytes, cap: usize) -> NewExchange {
        let duration_ms = self.started.elapsed().as_millis() as i64;

        let request_body = if self.request_body.is_empty() {
            None
        } else {
            let text = String::from_utf8_lossy(&self.request_body).into_owned();
            Some(domain::truncate_body(text, cap))
        };

        let response_text = decode_recorded_body(&response_body, self.gzipped);
        let response_body = domain::truncate_body(response_text, cap);

        NewExchange {
            timestamp: self.timestamp,
            method: self.method,
            path: self.path,
            request_headers: self.request_headers,
            request_body,
            response_status: self.response_status,
            response_headers: self.response_headers,
            response_body,
            duration_ms,
            token_usage: None,
        }
    }
}

fn build_target_url(base: &str, path_and_query: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
}

fn filtered_headers(headers: &HeaderMap, excluded: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if excluded.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Streaming iff the media type is exactly `text/event-stream`, parameters
/// and case aside.
fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case("text/event-stream"))
}

fn content_encoding_is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("gzip"))
}

/// Decode the accumulated wire bytes for recording: gunzip when the
/// forwarded `Content-Encoding` said gzip, then lossy UTF-8. The wire copy
/// is never touched.
fn decode_recorded_body(bytes: &[u8], gzipped: bool) -> String {
    if gzipped {
        let mut decoder = GzDecoder::new(bytes);
        let mut decoded = Vec::new();
        match decoder.read_to_end(&mut decoded) {
            Ok(_) => return String::from_utf8_lossy(&decoded).into_owned(),
            Err(err) => {
                warn!(error = %err, "failed to gunzip response body for recording");
            }
        }
    }
    String::from_utf8_lossy(bytes).into_owned()
}
