use chrono::{DateTime, Duration, TimeZone, Utc};
use llm_relay::{
    db::{self, pg::PgExchangeStore, ExchangeStore},
    domain::{NewExchange, TokenCounts},
};
use serde_json::json;

fn exchange_at(timestamp: DateTime<Utc>, path: &str, usage: Option<TokenCounts>) -> NewExchange {
    NewExchange {
        timestamp,
        method: "POST".to_owned(),
        path: path.to_owned(),
        request_headers: json!({"content-type": "application/json"}),
        request_body: Some("{}".to_owned()),
        response_status: 200,
        response_headers: json!({"content-type": "application/json"}),
        response_body: "{}".to_owned(),
        duration_ms: 5,
        token_usage: usage,
    }
}

#[tokio::test]
async fn postgres_exchange_projection_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let Some(database_url) = std::env::var("DATABASE_URL").ok() else {
        eprintln!("skipping integration test: DATABASE_URL is not set");
        return Ok(());
    };

    let pool = db::connect(&database_url).await?;
    db::run_migrations(&pool).await?;
    let store = PgExchangeStore::new(pool.clone());

    // A unique window far in the future keeps reruns from seeing each
    // other's rows.
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let base = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap()
        + Duration::seconds(nanos % 1_000_000_000);
    let window_end = base + Duration::hours(1);

    let usage = TokenCounts {
        model: Some("claude-sonnet-4-6".to_owned()),
        input_tokens: 11,
        output_tokens: 22,
        cache_read_tokens: 33,
        cache_creation_tokens: 44,
    };
    let with_usage = store
        .add(exchange_at(base, "/v1/messages", Some(usage)))
        .await?;
    let without_usage = store
        .add(exchange_at(
            base + Duration::minutes(30),
            "/v1/models",
            None,
        ))
        .await?;
    // Lands exactly on the exclusive upper bound.
    store
        .add(exchange_at(window_end, "/v1/messages", None))
        .await?;

    assert!(without_usage.id > with_usage.id);

    let projections = store.stats_projections(base, window_end).await?;
    assert_eq!(projections.len(), 2);

    let llm: Vec<_> = projections.iter().filter(|p| p.has_llm).collect();
    assert_eq!(llm.len(), 1);
    assert_eq!(llm[0].input_tokens, 11);
    assert_eq!(llm[0].output_tokens, 22);

    let plain = projections
        .iter()
        .find(|p| !p.has_llm)
        .expect("non-LLM projection should exist");
    assert_eq!(plain.input_tokens, 0);
    assert_eq!(plain.output_tokens, 0);

    // The usage row landed atomically with its parent, one-to-one.
    let (usage_rows,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM token_usage t
        JOIN exchanges e ON e.id = t.exchange_id
        WHERE e.timestamp >= $1 AND e.timestamp <= $2
        "#,
    )
    .bind(base)
    .bind(window_end)
    .fetch_one(&pool)
    .await?;
    assert_eq!(usage_rows, 1);

    sqlx::query(
        r#"
        DELETE FROM token_usage
        WHERE exchange_id IN (
            SELECT id FROM exchanges WHERE timestamp >= $1 AND timestamp <= $2
        )
        "#,
    )
    .bind(base)
    .bind(window_end)
    .execute(&pool)
    .await?;
    sqlx::query("DELETE FROM exchanges WHERE timestamp >= $1 AND timestamp <= $2")
        .bind(base)
        .bind(window_end)
        .execute(&pool)
        .await?;

    Ok(())
}
