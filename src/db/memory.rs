use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    db::ExchangeStore,
    domain::{NewExchange, StatsProjection, StoredExchange},
    errors::AppError,
};

/// A stored exchange with its assigned id, kept fully materialized so tests
/// can inspect what was recorded.
#[derive(Debug, Clone)]
pub struct ExchangeRow {
    pub id: i64,
    pub exchange: NewExchange,
}

#[derive(Clone, Default)]
pub struct MemoryExchangeStore {
    next_id: Arc<AtomicI64>,
    pub exchanges: Arc<RwLock<Vec<ExchangeRow>>>,
}

#[async_trait]
impl ExchangeStore for MemoryExchangeStore {
    async fn add(&self, exchange: NewExchange) -> Result<StoredExchange, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let stored = StoredExchange {
            id,
            timestamp: exchange.timestamp,
        };
        self.exchanges.write().await.push(ExchangeRow { id, exchange });
        Ok(stored)
    }

    async fn stats_projections(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatsProjection>, AppError> {
        let projections = self
            .exchanges
            .read()
            .await
            .iter()
            .filter(|row| row.exchange.timestamp >= from && row.exchange.timestamp < to)
            .map(|row| match &row.exchange.token_usage {
                Some(usage) => StatsProjection {
                    timestamp: row.exchange.timestamp,
                    has_llm: true,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                },
                None => StatsProjection {
                    timestamp: row.exchange.timestamp,
                    has_llm: false,
                    input_tokens: 0,
                    output_tokens: 0,
                },
            })
            .collect();

        Ok(projections)
    }
}
