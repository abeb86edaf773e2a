use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    db::ExchangeStore, domain::StatsProjection, errors::AppError, proxy, recorder::Recorder,
};

/// Shared per-process state: one store handle, one upstream client pool,
/// one recorder. Cloned per request by axum.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ExchangeStore>,
    pub recorder: Recorder,
    pub client: reqwest::Client,
    pub upstream_base_url: String,
    pub upstream_timeout: std::time::Duration,
    pub max_stored_body_bytes: usize,
}

/// Local routes are matched first; everything else falls through to the
/// proxy forwarder.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/stats/hourly", get(hourly_stats))
        .route("/api/stats/daily", get(daily_stats))
        .fallback(proxy::forward)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsBucket {
    pub time_bucket: DateTime<Utc>,
    pub request_count: i64,
    pub llm_request_count: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
}

#[derive(Debug, Clone, Copy)]
enum Bucketing {
    Hourly,
    Daily,
}

impl Bucketing {
    fn truncate(self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let granularity = match self {
            Bucketing::Hourly => Duration::hours(1),
            Bucketing::Daily => Duration::days(1),
        };
        timestamp.duration_trunc(granularity).unwrap_or(timestamp)
    }
}

async fn hourly_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<StatsBucket>>, AppError> {
    stats(state, query, Bucketing::Hourly).await
}

async fn daily_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<StatsBucket>>, AppError> {
    stats(state, query, Bucketing::Daily).await
}

/// `from` is inclusive, `to` exclusive; defaults cover the trailing week.
async fn stats(
    state: AppState,
    query: StatsQuery,
    bucketing: Bucketing,
) -> Result<Json<Vec<StatsBucket>>, AppError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or_else(|| to - Duration::days(7));

    let projections = state.store.stats_projections(from, to).await?;
    Ok(Json(aggregate(&projections, bucketing)))
}

/// Bucketing happens in process memory to stay free of dialect-specific
/// date SQL. Empty buckets are omitted, order is ascending.
fn aggregate(projections: &[StatsProjection], bucketing: Bucketing) -> Vec<StatsBucket> {
    let mut buckets: BTreeMap<DateTime<Utc>, StatsBucket> = BTreeMap::new();

    for projection in projections {
        let key = bucketing.truncate(projection.timestamp);
        let bucket = buckets.entry(key).or_insert_with(|| StatsBucket {
            time_bucket: key,
            request_count: 0,
            llm_request_count: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
        });
        bucket.request_count += 1;
        if projection.has_llm {
            bucket.llm_request_count += 1;
        }
        bucket.total_input_tokens += projection.input_tokens;
        bucket.total_output_tokens += projection.output_tokens;
    }

    buckets.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryExchangeStore;
    use crate::domain::{NewExchange, TokenCounts};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn projection(ts: DateTime<Utc>, has_llm: bool, input: i64, output: i64) -> StatsProjection {
        StatsProjection {
            timestamp: ts,
            has_llm,
            input_tokens: input,
            output_tokens: output,
        }
    }

    #[test]
    fn hourly_buckets_sum_and_sort() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let projections = vec![
            projection(base + Duration::minutes(59), true, 10, 20),
            projection(base + Duration::minutes(5), false, 0, 0),
            projection(base + Duration::hours(2), true, 1, 2),
        ];

        let buckets = aggregate(&projections, Bucketing::Hourly);

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].time_bucket, base);
        assert_eq!(buckets[0].request_count, 2);
        assert_eq!(buckets[0].llm_request_count, 1);
        assert_eq!(buckets[0].total_input_tokens, 10);
        assert_eq!(buckets[0].total_output_tokens, 20);
        assert_eq!(buckets[1].time_bucket, base + Duration::hours(2));
        assert_eq!(buckets[1].request_count, 1);
    }

    #[test]
    fn daily_buckets_cross_hour_boundaries() {
        let day = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let projections = vec![
            projection(day + Duration::hours(1), true, 5, 5),
            projection(day + Duration::hours(23), false, 0, 0),
            projection(day + Duration::days(1), false, 0, 0),
        ];

        let buckets = aggregate(&projections, Bucketing::Daily);

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].time_bucket, day);
        assert_eq!(buckets[0].request_count, 2);
        assert_eq!(buckets[1].time_bucket, day + Duration::days(1));
    }

    #[test]
    fn empty_projection_set_yields_no_buckets() {
        assert!(aggregate(&[], Bucketing::Hourly).is_empty());
    }

    fn test_state(store: MemoryExchangeStore) -> AppState {
        let store: Arc<dyn ExchangeStore> = Arc::new(store);
        AppState {
            recorder: Recorder::new(store.clone()),
            store,
            client: reqwest::Client::new(),
            upstream_base_url: "http://127.0.0.1:9".to_owned(),
            upstream_timeout: std::time::Duration::from_secs(1),
            max_stored_body_bytes: 1024,
        }
    }

    fn exchange_at(ts: DateTime<Utc>, usage: Option<TokenCounts>) -> NewExchange {
        NewExchange {
            timestamp: ts,
            method: "POST".to_owned(),
            path: "/v1/messages".to_owned(),
            request_headers: json!({}),
            request_body: None,
            response_status: 200,
            response_headers: json!({}),
            response_body: "{}".to_owned(),
            duration_ms: 3,
            token_usage: usage,
        }
    }

    #[tokio::test]
    async fn healthz_is_served_locally() {
        let app = router(test_state(MemoryExchangeStore::default()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn hourly_stats_reports_buckets_in_camel_case() {
        let store = MemoryExchangeStore::default();
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();
        store
            .add(exchange_at(
                ts,
                Some(TokenCounts {
                    model: Some("claude-x".to_owned()),
                    input_tokens: 10,
                    output_tokens: 20,
                    cache_read_tokens: 0,
                    cache_creation_tokens: 0,
                }),
            ))
            .await
            .expect("add should succeed");
        store
            .add(exchange_at(ts + Duration::minutes(10), None))
            .await
            .expect("add should succeed");

        let app = router(test_state(store));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/stats/hourly?from=2026-03-01T00:00:00Z&to=2026-03-02T00:00:00Z")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should collect");
        let buckets: Value = serde_json::from_slice(&bytes).expect("body should be JSON");

        assert_eq!(buckets.as_array().map(Vec::len), Some(1));
        assert_eq!(buckets[0]["timeBucket"], "2026-03-01T10:00:00Z");
        assert_eq!(buckets[0]["requestCount"], 2);
        assert_eq!(buckets[0]["llmRequestCount"], 1);
        assert_eq!(buckets[0]["totalInputTokens"], 10);
        assert_eq!(buckets[0]["totalOutputTokens"], 20);
    }

    #[tokio::test]
    async fn stats_range_upper_bound_is_exclusive() {
        let store = MemoryExchangeStore::default();
        let to = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        store
            .add(exchange_at(to, None))
            .await
            .expect("add should succeed");

        let app = router(test_state(store));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/stats/daily?from=2026-03-01T00:00:00Z&to=2026-03-02T00:00:00Z")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("request should succeed");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should collect");
        let buckets: Value = serde_json::from_slice(&bytes).expect("body should be JSON");
        assert_eq!(buckets.as_array().map(Vec::len), Some(0));
    }
}
