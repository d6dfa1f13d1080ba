//! Retrying access to the relational store
//!
//! Every statement runs on a connection borrowed from the bounded pool, so
//! the pool size caps concurrent database work no matter how many entities
//! are in flight. Connection-level faults are retried; constraint and syntax
//! errors are not.

use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::{QueryBuilder, Transaction};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use super::{SqlValue, MAX_BIND_PARAMS};
use crate::context::RunContext;
use crate::error::{BatchFailure, BulkLoadError, FailureKind, QueryError};
use crate::retry::{RetryError, RetryPolicy, Retryable};

/// A sqlx error wrapped for retry classification
#[derive(Debug)]
pub struct SqlFailure(pub sqlx::Error);

impl fmt::Display for SqlFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SQLSTATE codes worth retrying: connection exceptions (class 08),
/// serialization failure, deadlock, admin shutdown, too many connections
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01" | "53300")
}

impl Retryable for SqlFailure {
    fn is_transient(&self) -> bool {
        match &self.0 {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|c| is_transient_sqlstate(&c)),
            _ => false,
        }
    }
}

fn to_query_error(err: RetryError<SqlFailure>) -> QueryError {
    let kind = err.kind();
    let attempts = err.attempts();
    match err.into_last_error() {
        Some(SqlFailure(sqlx::Error::PoolTimedOut)) if kind == FailureKind::TransientExhausted => {
            QueryError::PoolExhausted { attempts }
        },
        Some(failure) => QueryError::Database {
            kind,
            attempts,
            message: failure.to_string(),
        },
        None => QueryError::Database {
            kind,
            attempts,
            message: "cancelled before first attempt".to_string(),
        },
    }
}

/// Double-quote an identifier after checking it is `[A-Za-z0-9_]+`
pub fn quote_ident(name: &str) -> Result<String, QueryError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(QueryError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

/// Rows per bulk statement for a given column count
pub fn rows_per_batch(max_rows: usize, columns: usize) -> usize {
    let by_params = MAX_BIND_PARAMS / columns.max(1);
    max_rows.min(by_params).max(1)
}

/// Build one multi-row INSERT, upserting on `conflict_key` when given
pub fn build_insert(
    table: &str,
    columns: &[String],
    rows: Vec<Vec<SqlValue>>,
    conflict_key: Option<&str>,
) -> Result<QueryBuilder<'static, Postgres>, QueryError> {
    let table = quote_ident(table)?;
    let quoted = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, quoted.join(", ")));
    builder.push_values(rows, |mut b, row| {
        for value in row {
            value.push_to(&mut b);
        }
    });

    if let Some(key) = conflict_key {
        let key_quoted = quote_ident(key)?;
        let updates: Vec<String> = columns
            .iter()
            .zip(&quoted)
            .filter(|(name, _)| name.as_str() != key)
            .map(|(_, q)| format!("{q} = EXCLUDED.{q}"))
            .collect();

        if updates.is_empty() {
            builder.push(format!(" ON CONFLICT ({}) DO NOTHING", key_quoted));
        } else {
            builder.push(format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                key_quoted,
                updates.join(", ")
            ));
        }
    }

    Ok(builder)
}

/// Pooled, retrying database access shared by all components
pub struct Gateway {
    pool: PgPool,
    retry: RetryPolicy,
    max_batch_rows: usize,
    writes_issued: AtomicU64,
}

impl Gateway {
    pub fn new(pool: PgPool, retry: RetryPolicy, max_batch_rows: usize) -> Self {
        Self {
            pool,
            retry,
            max_batch_rows: max_batch_rows.max(1),
            writes_issued: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Data-mutating statements sent so far (dry runs must leave this at 0)
    pub fn writes_issued(&self) -> u64 {
        self.writes_issued.load(Ordering::Relaxed)
    }

    /// Run one statement and return the affected row count
    pub async fn execute(
        &self,
        ctx: &RunContext,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<u64, QueryError> {
        debug!(sql, params = params.len(), "execute");

        let result = self
            .retry
            .run("execute", &ctx.cancel, |_| {
                let params = params.clone();
                self.writes_issued.fetch_add(1, Ordering::Relaxed);
                async move {
                    let query = params
                        .into_iter()
                        .fold(sqlx::query(sql), |q, value| value.bind_to(q));
                    query.execute(&self.pool).await.map_err(SqlFailure)
                }
            })
            .await
            .map_err(to_query_error)?;

        Ok(result.rows_affected())
    }

    /// Run a read-only query
    pub async fn fetch_all(
        &self,
        ctx: &RunContext,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<PgRow>, QueryError> {
        self.retry
            .run("fetch", &ctx.cancel, |_| {
                let params = params.clone();
                async move {
                    let query = params
                        .into_iter()
                        .fold(sqlx::query(sql), |q, value| value.bind_to(q));
                    query.fetch_all(&self.pool).await.map_err(SqlFailure)
                }
            })
            .await
            .map_err(to_query_error)
    }

    /// Run `f` inside one transaction
    ///
    /// Commits when `f` returns `Ok`; rolls back when it returns `Err`
    /// (including an explicit [`QueryError::Aborted`]). The connection goes
    /// back to the pool on every path, and a dropped transaction rolls back.
    pub async fn with_transaction<T, F>(&self, ctx: &RunContext, f: F) -> Result<T, QueryError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Transaction<'static, Postgres>) -> BoxFuture<'c, Result<T, QueryError>>
            + Send,
    {
        let mut tx = self
            .retry
            .run("begin", &ctx.cancel, |_| async {
                self.pool.begin().await.map_err(SqlFailure)
            })
            .await
            .map_err(to_query_error)?;

        self.writes_issued.fetch_add(1, Ordering::Relaxed);

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await.map_err(|e| QueryError::Database {
                    kind: FailureKind::Permanent,
                    attempts: 1,
                    message: format!("commit failed: {}", e),
                })?;
                Ok(value)
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback failed: {}", rollback_err);
                }
                debug!("Transaction rolled back: {}", err);
                Err(err)
            },
        }
    }

    /// Statement helper for use inside [`Gateway::with_transaction`]
    pub async fn execute_in(
        tx: &mut Transaction<'static, Postgres>,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<u64, QueryError> {
        let query = params
            .into_iter()
            .fold(sqlx::query(sql), |q, value| value.bind_to(q));
        query
            .execute(&mut **tx)
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| QueryError::Database {
                kind: FailureKind::Permanent,
                attempts: 1,
                message: e.to_string(),
            })
    }

    /// Insert (or upsert on `conflict_key`) rows in bounded batches
    ///
    /// Each batch is its own statement. A failed batch does not stop later
    /// ones; the error lists every failed batch index. Pool exhaustion and
    /// cancellation stop the remaining batches.
    pub async fn bulk_load(
        &self,
        ctx: &RunContext,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<SqlValue>>,
        conflict_key: Option<&str>,
    ) -> Result<u64, BulkLoadError> {
        let batch_rows = rows_per_batch(self.max_batch_rows, columns.len());
        let batches: Vec<Vec<Vec<SqlValue>>> = {
            let mut rows = rows.into_iter().peekable();
            let mut batches = Vec::new();
            while rows.peek().is_some() {
                batches.push(rows.by_ref().take(batch_rows).collect());
            }
            batches
        };
        let total_batches = batches.len();

        let mut rows_loaded = 0u64;
        let mut failures = Vec::new();
        let mut pool_exhausted = false;

        for (index, batch) in batches.into_iter().enumerate() {
            if ctx.is_cancelled() {
                failures.extend((index..total_batches).map(|batch_index| BatchFailure {
                    batch_index,
                    kind: FailureKind::Cancelled,
                    message: "run cancelled".to_string(),
                }));
                break;
            }

            let size = batch.len();
            let result = self
                .retry
                .run("bulk_load", &ctx.cancel, |_| {
                    let batch = batch.clone();
                    self.writes_issued.fetch_add(1, Ordering::Relaxed);
                    async move {
                        let mut builder = build_insert(table, columns, batch, conflict_key)
                            .map_err(|e| SqlFailure(sqlx::Error::Protocol(e.to_string())))?;
                        builder.build().execute(&self.pool).await.map_err(SqlFailure)
                    }
                })
                .await
                .map_err(to_query_error);

            match result {
                Ok(done) => {
                    rows_loaded += done.rows_affected();
                    debug!(
                        "{}: batch {}/{} loaded {} rows",
                        table,
                        index + 1,
                        total_batches,
                        size
                    );
                },
                Err(err) => {
                    error!("{}: batch {} of {} failed: {}", table, index, total_batches, err);
                    let exhausted = err.is_run_fatal();
                    failures.push(BatchFailure {
                        batch_index: index,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    if exhausted {
                        pool_exhausted = true;
                        break;
                    }
                },
            }
        }

        if failures.is_empty() {
            info!("{}: loaded {} rows in {} batches", table, rows_loaded, total_batches);
            Ok(rows_loaded)
        } else {
            Err(BulkLoadError {
                table: table.to_string(),
                total_batches,
                rows_loaded,
                failures,
                pool_exhausted,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqlType;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("product").unwrap(), "\"product\"");
        assert_eq!(quote_ident("name_embedding").unwrap(), "\"name_embedding\"");
        assert!(quote_ident("x\"; DROP TABLE y; --").is_err());
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn test_rows_per_batch_respects_param_limit() {
        assert_eq!(rows_per_batch(1000, 5), 1000);
        assert_eq!(rows_per_batch(100_000, 100), 655);
        assert_eq!(rows_per_batch(0, 3), 1);
    }

    #[test]
    fn test_build_upsert_sql() {
        let columns = vec!["id".to_string(), "name".to_string(), "price".to_string()];
        let rows = vec![
            vec![SqlValue::from("1"), SqlValue::from("Widget"), SqlValue::Float(9.5)],
            vec![
                SqlValue::from("2"),
                SqlValue::Null(SqlType::Text),
                SqlValue::Null(SqlType::Double),
            ],
        ];

        let builder = build_insert("product", &columns, rows, Some("id")).unwrap();
        let sql = builder.sql();

        assert!(sql.starts_with("INSERT INTO \"product\" (\"id\", \"name\", \"price\") VALUES ($1, $2, $3), ($4, $5, $6)"));
        assert!(sql.ends_with(
            "ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\", \"price\" = EXCLUDED.\"price\""
        ));
    }

    #[test]
    fn test_build_insert_key_only_does_nothing_on_conflict() {
        let columns = vec!["id".to_string()];
        let builder =
            build_insert("tag", &columns, vec![vec![SqlValue::from("a")]], Some("id")).unwrap();
        assert!(builder.sql().ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn test_pool_timeout_is_transient_and_exhausts_to_pool_error() {
        assert!(SqlFailure(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!SqlFailure(sqlx::Error::RowNotFound).is_transient());

        let err = to_query_error(RetryError::Exhausted {
            error: SqlFailure(sqlx::Error::PoolTimedOut),
            attempts: 3,
        });
        assert!(matches!(err, QueryError::PoolExhausted { attempts: 3 }));
        assert!(err.is_run_fatal());
    }

    #[test]
    fn test_sqlstate_classification() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("40001"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42601"));
    }
}
