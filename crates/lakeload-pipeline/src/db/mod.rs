use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::error::QueryError;

pub mod gateway;
pub mod value;

pub use gateway::Gateway;
pub use value::{SqlType, SqlValue};

/// Postgres bind parameter limit per statement
pub const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DbConfig {
    #[serde(skip_serializing)]
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long to wait for a pooled connection before timing out
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
    /// Upper bound on rows per bulk-load statement
    pub bulk_batch_rows: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: Some(600),
            max_lifetime_secs: Some(1800),
            bulk_batch_rows: 1_000,
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Overlay `DATABASE_URL` and whatever `DB_*` variables are set
    pub fn merge_env(mut self) -> Self {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.url = url;
        }
        if let Some(max) = parsed("DB_MAX_CONNECTIONS") {
            self.max_connections = max;
        }
        if let Some(min) = parsed("DB_MIN_CONNECTIONS") {
            self.min_connections = min;
        }
        if let Some(timeout) = parsed("DB_ACQUIRE_TIMEOUT") {
            self.acquire_timeout_secs = timeout;
        }
        if let Some(idle) = parsed("DB_IDLE_TIMEOUT") {
            self.idle_timeout_secs = Some(idle);
        }
        if let Some(lifetime) = parsed("DB_MAX_LIFETIME") {
            self.max_lifetime_secs = Some(lifetime);
        }
        if let Some(rows) = parsed("DB_BULK_BATCH_ROWS") {
            self.bulk_batch_rows = rows;
        }
        self
    }

    fn pool_options(&self) -> PgPoolOptions {
        let mut options = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs));

        if let Some(idle_timeout) = self.idle_timeout_secs {
            options = options.idle_timeout(Duration::from_secs(idle_timeout));
        }

        if let Some(max_lifetime) = self.max_lifetime_secs {
            options = options.max_lifetime(Duration::from_secs(max_lifetime));
        }

        options
    }
}

pub async fn create_pool(config: &DbConfig) -> Result<PgPool, QueryError> {
    if config.url.is_empty() {
        return Err(QueryError::Config("DATABASE_URL not set".to_string()));
    }

    let pool = config
        .pool_options()
        .connect(&config.url)
        .await
        .map_err(|e| QueryError::Config(format!("failed to connect: {}", e)))?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Pool that opens no connection until first use (dry runs never use it)
pub fn create_lazy_pool(config: &DbConfig) -> Result<PgPool, QueryError> {
    let url = if config.url.is_empty() {
        "postgres://localhost/lakeload"
    } else {
        config.url.as_str()
    };

    config
        .pool_options()
        .min_connections(0)
        .connect_lazy(url)
        .map_err(|e| QueryError::Config(format!("invalid database URL: {}", e)))
}

pub async fn health_check(pool: &PgPool) -> Result<(), QueryError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(|e| QueryError::Config(format!("health check failed: {}", e)))
}
