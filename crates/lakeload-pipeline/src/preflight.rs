//! Connectivity checks run before a load
//!
//! Each check yields a [`CheckItem`]. A missing pgvector extension is only a
//! warning since embeddings fall back to `REAL[]` storage.

use serde::Serialize;
use sqlx::Row;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::RunContext;
use crate::db::Gateway;
use crate::discovery::StorageDiscovery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "FAIL",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckItem {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckItem {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        let item = Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        };
        match status {
            CheckStatus::Pass => info!("{}: {}", item.name, item.detail),
            _ => warn!("{} [{}]: {}", item.name, status, item.detail),
        }
        item
    }

    pub fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, detail)
    }

    pub fn warn(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, detail)
    }

    pub fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckReport {
    pub checks: Vec<CheckItem>,
}

impl CheckReport {
    pub fn push(&mut self, item: CheckItem) {
        self.checks.push(item);
    }

    /// True unless some check failed; warnings still pass
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            out.push_str(&format!("[{:>4}] {}: {}\n", check.status, check.name, check.detail));
        }
        out.push_str(if self.passed() {
            "All connection checks passed"
        } else {
            "Connection checks failed"
        });
        out
    }
}

pub const STORAGE_CHECK: &str = "storage";
pub const DATABASE_CHECK: &str = "database";
pub const PGVECTOR_CHECK: &str = "pgvector";

/// The latest batch must be discoverable and hold at least one entity
pub async fn check_storage(discovery: &StorageDiscovery, cancel: &CancellationToken) -> CheckItem {
    match discovery.find_latest_batch(cancel).await {
        Ok(batch) if batch.entities.is_empty() => CheckItem::fail(
            STORAGE_CHECK,
            format!("no entity folders in {}", batch.location),
        ),
        Ok(batch) => CheckItem::pass(
            STORAGE_CHECK,
            format!(
                "latest date folder {} with entities [{}]",
                batch.date_folder_id,
                batch.entity_names().join(", ")
            ),
        ),
        Err(e) => CheckItem::fail(STORAGE_CHECK, e.to_string()),
    }
}

/// Server version, then whether the `vector` extension can be used
pub async fn check_database(gateway: &Gateway, ctx: &RunContext) -> Vec<CheckItem> {
    let version = match gateway.fetch_all(ctx, "SELECT version()", Vec::new()).await {
        Ok(rows) => rows
            .first()
            .and_then(|row| row.try_get::<String, _>(0).ok())
            .unwrap_or_else(|| "unknown version".to_string()),
        Err(e) => return vec![CheckItem::fail(DATABASE_CHECK, e.to_string())],
    };

    let vector = match gateway
        .fetch_all(
            ctx,
            "SELECT installed_version::text FROM pg_available_extensions WHERE name = 'vector'",
            Vec::new(),
        )
        .await
    {
        Ok(rows) => match rows.first() {
            None => CheckItem::warn(
                PGVECTOR_CHECK,
                "extension not available; embeddings will be stored as REAL[]",
            ),
            Some(row) => match row.try_get::<Option<String>, _>(0).ok().flatten() {
                Some(installed) => CheckItem::pass(PGVECTOR_CHECK, format!("installed ({})", installed)),
                None => CheckItem::pass(PGVECTOR_CHECK, "available, created on first embedding run"),
            },
        },
        Err(e) => CheckItem::warn(PGVECTOR_CHECK, e.to_string()),
    };

    vec![CheckItem::pass(DATABASE_CHECK, version), vector]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryConfig;
    use crate::retry::RetryPolicy;
    use crate::storage::MemoryObjectStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn discovery(store: Arc<MemoryObjectStore>) -> StorageDiscovery {
        let config = DiscoveryConfig {
            root_prefix: "exports".to_string(),
            ..DiscoveryConfig::default()
        };
        let retry = RetryPolicy::new(2, Duration::from_millis(10)).without_jitter();
        StorageDiscovery::new(store, config, retry).unwrap()
    }

    #[tokio::test]
    async fn test_storage_check_reports_latest_folder() {
        let store = Arc::new(MemoryObjectStore::new("lake"));
        store.put("exports/2025-04-13-09/products/part-0.parquet", "p");
        store.put("exports/2025-04-14-09/products/part-0.parquet", "p");
        store.put("exports/2025-04-14-09/customers/part-0.parquet", "c");

        let item = check_storage(&discovery(store), &CancellationToken::new()).await;

        assert_eq!(item.status, CheckStatus::Pass);
        assert_eq!(
            item.detail,
            "latest date folder 2025-04-14-09 with entities [customer, product]"
        );
    }

    #[tokio::test]
    async fn test_storage_check_fails_without_batches() {
        let store = Arc::new(MemoryObjectStore::new("lake"));
        store.put("exports/scratch/notes.txt", "x");

        let item = check_storage(&discovery(store), &CancellationToken::new()).await;
        assert_eq!(item.status, CheckStatus::Fail);
        assert_eq!(item.name, STORAGE_CHECK);
    }

    #[test]
    fn test_warnings_do_not_fail_the_report() {
        let mut report = CheckReport::default();
        report.push(CheckItem::pass(DATABASE_CHECK, "PostgreSQL 16"));
        report.push(CheckItem::warn(PGVECTOR_CHECK, "extension not available"));
        assert!(report.passed());
        assert!(report.summary().ends_with("All connection checks passed"));

        report.push(CheckItem::fail(STORAGE_CHECK, "bucket not found"));
        assert!(!report.passed());
        assert!(report.summary().contains("[FAIL] storage: bucket not found"));
    }
}
