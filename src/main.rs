use std::{sync::Arc, time::Duration};

use llm_relay::{
    api::{self, AppState},
    config::AppConfig,
    db::{self, pg::PgExchangeStore, ExchangeStore},
    recorder::Recorder,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=info".into()),
        )
        .init();

    let config = AppConfig::from_env().map_err(|err| anyhow::anyhow!(err))?;

    let pool = db::connect(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    // One client (and connection pool) for the process. Redirects must not
    // be followed and bodies must pass through compressed, so no
    // decompression features are enabled on reqwest.
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let store: Arc<dyn ExchangeStore> = Arc::new(PgExchangeStore::new(pool));
    let state = AppState {
        recorder: Recorder::new(store.clone()),
        store,
        client,
        upstream_base_url: config.upstream_base_url.clone(),
        upstream_timeout: Duration::from_secs(config.upstream_timeout_seconds),
        max_stored_body_bytes: config.max_stored_body_bytes,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        upstream = %config.upstream_base_url,
        "llm-relay listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}
