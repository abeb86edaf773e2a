use std::sync::Arc;

use tracing::warn;

use crate::{
    db::ExchangeStore,
    domain::{NewExchange, StoredExchange},
    errors::AppError,
    usage,
};

/// Background persistence for captured exchanges. The forwarder hands an
/// exchange over exactly once; everything after that is off its response
/// path.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn ExchangeStore>,
}

impl Recorder {
    pub fn new(store: Arc<dyn ExchangeStore>) -> Self {
        Self { store }
    }

    /// Fire-and-forget: spawns a detached task, logs any failure at warning
    /// level and swallows it. Never raises to the caller.
    pub fn record(&self, exchange: NewExchange) {
        let recorder = self.clone();
        tokio::spawn(async move {
            let method = exchange.method.clone();
            let path = exchange.path.clone();
            if let Err(err) = recorder.record_core(exchange).await {
                warn!(%method, %path, error = %err, "failed to record exchange");
            }
        });
    }

    /// The synchronous core of [`record`](Self::record), callable directly
    /// from tests: classify, parse token usage, persist atomically.
    pub async fn record_core(
        &self,
        mut exchange: NewExchange,
    ) -> Result<StoredExchange, AppError> {
        if usage::is_messages_call(&exchange.method, &exchange.path) {
            let streaming = response_is_event_stream(&exchange.response_headers);
            match usage::parse_usage(&exchange.response_body, streaming) {
                Some(counts) => exchange.token_usage = Some(counts),
                None => warn!(
                    method = %exchange.method,
                    path = %exchange.path,
                    "messages response carried no parseable token usage"
                ),
            }
        }

        self.store.add(exchange).await
    }
}

/// Streaming flag for the parser, derived from the recorded response
/// headers rather than the live response.
fn response_is_event_stream(headers: &serde_json::Value) -> bool {
    headers
        .as_object()
        .and_then(|map| {
            map.iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                .and_then(|(_, value)| value.as_str())
        })
        .is_some_and(|value| value.to_ascii_lowercase().contains("text/event-stream"))
}
