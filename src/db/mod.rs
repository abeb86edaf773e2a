use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::{
    domain::{NewExchange, StatsProjection, StoredExchange},
    errors::AppError,
};

pub mod memory;
pub mod pg;

/// Append-only exchange log plus the range projection the stats aggregator
/// reads. Implementations own their transaction handling; `add` must insert
/// the exchange and its optional token usage atomically.
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    async fn add(&self, exchange: NewExchange) -> Result<StoredExchange, AppError>;

    /// Every exchange with `from <= timestamp < to`, projected for
    /// aggregation. Ordering is unspecified.
    async fn stats_projections(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatsProjection>, AppError>;
}

pub async fn connect(database_url: &str) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
