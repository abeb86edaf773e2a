use std::{env, error::Error};

const DEFAULT_UPSTREAM_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_MAX_STORED_BODY_BYTES: usize = 1_048_576;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Process configuration, read once at startup and immutable thereafter.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub upstream_base_url: String,
    pub upstream_timeout_seconds: u64,
    pub max_stored_body_bytes: usize,
    pub database_url: String,
    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let raw_base_url =
            env::var("UPSTREAM_BASE_URL").map_err(|_| "UPSTREAM_BASE_URL must be set")?;
        let upstream_base_url = raw_base_url.trim_end_matches('/').to_owned();
        if upstream_base_url.is_empty() {
            return Err("UPSTREAM_BASE_URL must not be empty".into());
        }

        let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?;

        let upstream_timeout_seconds = match env::var("UPSTREAM_TIMEOUT_SECONDS") {
            Ok(raw) => raw.parse::<u64>()?,
            Err(env::VarError::NotPresent) => DEFAULT_UPSTREAM_TIMEOUT_SECONDS,
            Err(err) => return Err(Box::new(err)),
        };

        let max_stored_body_bytes = match env::var("MAX_STORED_BODY_BYTES") {
            Ok(raw) => raw.parse::<usize>()?,
            Err(env::VarError::NotPresent) => DEFAULT_MAX_STORED_BODY_BYTES,
            Err(err) => return Err(Box::new(err)),
        };

        let bind_addr = match env::var("BIND_ADDR") {
            Ok(raw) => raw,
            Err(env::VarError::NotPresent) => DEFAULT_BIND_ADDR.to_owned(),
            Err(err) => return Err(Box::new(err)),
        };

        Ok(Self {
            upstream_base_url,
            upstream_timeout_seconds,
            max_stored_body_bytes,
            database_url,
            bind_addr,
        })
    }
}
