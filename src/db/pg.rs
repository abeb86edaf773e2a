use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    db::ExchangeStore,
    domain::{NewExchange, StatsProjection, StoredExchange},
    errors::AppError,
};

#[derive(Clone)]
pub struct PgExchangeStore {
    pool: PgPool,
}

impl PgExchangeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ExchangeStore for PgExchangeStore {
    async fn add(&self, exchange: NewExchange) -> Result<StoredExchange, AppError> {
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query_as::<_, StoredExchange>(
            r#"
            INSERT INTO exchanges
                (timestamp, method, path, request_headers, request_body,
                 response_status, response_headers, response_body, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, timestamp
            "#,
        )
        .bind(exchange.timestamp)
        .bind(&exchange.method)
        .bind(&exchange.path)
        .bind(&exchange.request_headers)
        .bind(exchange.request_body.as_deref())
        .bind(exchange.response_status)
        .bind(&exchange.response_headers)
        .bind(&exchange.response_body)
        .bind(exchange.duration_ms)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(usage) = &exchange.token_usage {
            sqlx::query(
                r#"
                INSERT INTO token_usage
                    (exchange_id, timestamp, model, input_tokens, output_tokens,
                     cache_read_tokens, cache_creation_tokens)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(stored.id)
            .bind(stored.timestamp)
            .bind(usage.model.as_deref())
            .bind(usage.input_tokens)
            .bind(usage.output_tokens)
            .bind(usage.cache_read_tokens)
            .bind(usage.cache_creation_tokens)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(stored)
    }

    async fn stats_projections(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatsProjection>, AppError> {
        let projections = sqlx::query_as::<_, StatsProjection>(
            r#"
            SELECT e.timestamp,
                   t.id IS NOT NULL AS has_llm,
                   COALESCE(t.input_tokens, 0) AS input_tokens,
                   COALESCE(t.output_tokens, 0) AS output_tokens
            FROM exchanges e
            LEFT JOIN token_usage t ON t.exchange_id = e.id
            WHERE e.timestamp >= $1 AND e.timestamp < $2
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(projections)
    }
}
