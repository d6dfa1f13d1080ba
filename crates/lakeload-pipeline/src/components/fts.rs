//! Full-text search columns
//!
//! For a text column `c` this maintains `c_tsv` (the search vector),
//! `c_tsv_hash` (md5 of the text it was built from) and a GIN index. Rows
//! whose text still hashes to `c_tsv_hash` are left alone.
//!
//! [`search`] queries those vectors with `plainto_tsquery`, ranked by
//! `ts_rank`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{resolve_target, table_columns, EntityData, PipelineComponent, StageOutcome};
use crate::context::RunContext;
use crate::db::gateway::quote_ident;
use crate::db::{Gateway, SqlValue};
use crate::discovery::EntityRef;
use crate::components::importer::{ID_COLUMN, ROW_KEY_COLUMN};
use crate::error::{FailureKind, IndexError, PipelineError, QueryError};

pub const COMPONENT_NAME: &str = "fts_indexer";
pub const DEFAULT_LANGUAGE: &str = "english";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FtsConfig {
    /// Text search configuration passed to `to_tsvector`
    pub language: String,
    pub text_columns: Option<Vec<String>>,
    pub max_text_columns: usize,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_string(),
            text_columns: None,
            max_text_columns: 3,
        }
    }
}

/// Statements that bring one column's search vector up to date
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStatements {
    pub add_columns: String,
    pub refresh: String,
    pub create_index: String,
    pub reindex: Option<String>,
}

pub fn column_statements(table: &str, column: &str, force: bool) -> Result<ColumnStatements, QueryError> {
    let t = quote_ident(table)?;
    let c = quote_ident(column)?;
    let tsv = quote_ident(&format!("{}_tsv", column))?;
    let hash = quote_ident(&format!("{}_tsv_hash", column))?;
    let index = quote_ident(&format!("{}_{}_tsv_idx", table, column))?;
    let digest = format!("md5(coalesce({}::text, ''))", c);

    let changed = if force {
        String::new()
    } else {
        format!(" WHERE {} IS DISTINCT FROM {}", hash, digest)
    };

    Ok(ColumnStatements {
        add_columns: format!(
            "ALTER TABLE {t} ADD COLUMN IF NOT EXISTS {tsv} tsvector, \
             ADD COLUMN IF NOT EXISTS {hash} TEXT"
        ),
        refresh: format!(
            "UPDATE {t} SET {tsv} = to_tsvector($1::regconfig, coalesce({c}::text, '')), \
             {hash} = {digest}{changed}"
        ),
        create_index: format!("CREATE INDEX IF NOT EXISTS {index} ON {t} USING GIN ({tsv})"),
        reindex: force.then(|| format!("REINDEX INDEX {index}")),
    })
}

/// One ranked row from [`search`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub key: String,
    pub text: Option<String>,
    pub rank: f64,
}

/// `$1` is the text search configuration, `$2` the query, `$3` the limit
pub fn search_sql(table: &str, key_column: &str, column: &str) -> Result<String, QueryError> {
    let t = quote_ident(table)?;
    let k = quote_ident(key_column)?;
    let c = quote_ident(column)?;
    let tsv = quote_ident(&format!("{}_tsv", column))?;

    Ok(format!(
        "SELECT {k}::text, {c}::text, ts_rank({tsv}, q)::float8 AS rank \
         FROM {t}, plainto_tsquery($1::regconfig, $2) AS q \
         WHERE {tsv} @@ q ORDER BY rank DESC, {k} LIMIT $3"
    ))
}

/// Rows of `table` whose `column` matches `query`, best first
///
/// Uses the default `english` configuration; see [`search_with_language`].
pub async fn search(
    gateway: &Gateway,
    ctx: &RunContext,
    table: &str,
    column: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>, QueryError> {
    search_with_language(gateway, ctx, DEFAULT_LANGUAGE, table, column, query, limit).await
}

/// Like [`search`], with an explicit text search configuration
///
/// A table without `<column>_tsv` has not been indexed yet and yields no hits.
pub async fn search_with_language(
    gateway: &Gateway,
    ctx: &RunContext,
    language: &str,
    table: &str,
    column: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>, QueryError> {
    if query.trim().is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let columns = table_columns(gateway, ctx, table).await?;
    let tsv = format!("{}_tsv", column);
    if !columns.iter().any(|(name, _)| *name == tsv) {
        warn!("'{}' has no search vector for '{}'", table, column);
        return Ok(Vec::new());
    }
    let key_column = if columns.iter().any(|(name, _)| name == ID_COLUMN) {
        ID_COLUMN
    } else {
        ROW_KEY_COLUMN
    };

    let sql = search_sql(table, key_column, column)?;
    let rows = gateway
        .fetch_all(
            ctx,
            &sql,
            vec![
                SqlValue::from(language),
                SqlValue::from(query),
                SqlValue::Int(i64::try_from(limit).unwrap_or(i64::MAX)),
            ],
        )
        .await?;

    let hits = rows
        .iter()
        .map(|row| {
            Ok(SearchHit {
                key: row.try_get(0)?,
                text: row.try_get(1)?,
                rank: row.try_get(2)?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(|e| QueryError::Database {
            kind: FailureKind::Permanent,
            attempts: 1,
            message: e.to_string(),
        })?;

    debug!("{} hit(s) for '{}' in {}.{}", hits.len(), query, table, column);
    Ok(hits)
}

pub struct FtsIndexer {
    gateway: Arc<Gateway>,
    config: FtsConfig,
}

impl FtsIndexer {
    pub fn new(gateway: Arc<Gateway>, config: FtsConfig) -> Self {
        Self { gateway, config }
    }

    /// [`search_with_language`] using the configured language
    pub async fn search(
        &self,
        ctx: &RunContext,
        table: &str,
        column: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, QueryError> {
        search_with_language(&self.gateway, ctx, &self.config.language, table, column, query, limit).await
    }

    /// Refresh one column inside a single transaction; returns rows updated
    async fn index_column(&self, ctx: &RunContext, table: &str, column: &str) -> Result<u64, IndexError> {
        let to_index_error = |source: QueryError| IndexError {
            column: column.to_string(),
            source,
        };

        let statements = column_statements(table, column, ctx.force).map_err(to_index_error)?;
        let language = self.config.language.clone();

        self.gateway
            .with_transaction(ctx, move |tx| {
                Box::pin(async move {
                    Gateway::execute_in(tx, &statements.add_columns, Vec::new()).await?;
                    let updated =
                        Gateway::execute_in(tx, &statements.refresh, vec![SqlValue::Text(language)])
                            .await?;
                    Gateway::execute_in(tx, &statements.create_index, Vec::new()).await?;
                    if let Some(reindex) = &statements.reindex {
                        Gateway::execute_in(tx, reindex, Vec::new()).await?;
                    }
                    Ok(updated)
                })
            })
            .await
            .map_err(to_index_error)
    }
}

#[async_trait]
impl PipelineComponent for FtsIndexer {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    async fn process_entity(
        &self,
        ctx: &RunContext,
        entity: &EntityRef,
        data: &mut EntityData,
    ) -> Result<StageOutcome, PipelineError> {
        if ctx.dry_run {
            return Ok(StageOutcome::skipped(format!(
                "would build '{}' search vectors and GIN indexes for text columns of '{}'",
                self.config.language, entity.name
            )));
        }

        let Some(target) = resolve_target(
            &self.gateway,
            ctx,
            entity,
            data,
            self.config.text_columns.as_deref(),
            self.config.max_text_columns,
        )
        .await?
        else {
            return Ok(StageOutcome::failure(
                format!("table '{}' does not exist", entity.name),
                None,
            ));
        };

        if target.text_columns.is_empty() {
            return Ok(StageOutcome::skipped(format!(
                "no text columns to index in '{}'",
                target.table
            )));
        }

        let mut updated = 0u64;
        let mut indexed: Vec<&str> = Vec::new();
        let mut failed: Vec<IndexError> = Vec::new();

        for column in &target.text_columns {
            if ctx.is_cancelled() {
                failed.push(IndexError {
                    column: column.clone(),
                    source: QueryError::Aborted("run cancelled".to_string()),
                });
                continue;
            }

            match self.index_column(ctx, &target.table, column).await {
                Ok(rows) => {
                    updated += rows;
                    indexed.push(column);
                },
                Err(err) if err.source.is_run_fatal() => return Err(err.into()),
                Err(err) => {
                    warn!("{}: {}", target.table, err);
                    failed.push(err);
                },
            }
        }

        if let Some(first) = failed.first() {
            return Ok(StageOutcome::failure(
                format!(
                    "{} of {} column(s) failed in '{}' ({}); indexed: [{}]",
                    failed.len(),
                    target.text_columns.len(),
                    target.table,
                    first,
                    indexed.join(", ")
                ),
                Some(updated),
            ));
        }

        info!("{}: search vectors refreshed for {} row(s)", target.table, updated);
        Ok(StageOutcome::success(
            format!(
                "indexed [{}] in '{}', {} row(s) refreshed",
                indexed.join(", "),
                target.table,
                updated
            ),
            Some(updated),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_only_touches_changed_rows() {
        let s = column_statements("product", "name", false).unwrap();

        assert_eq!(
            s.add_columns,
            "ALTER TABLE \"product\" ADD COLUMN IF NOT EXISTS \"name_tsv\" tsvector, \
             ADD COLUMN IF NOT EXISTS \"name_tsv_hash\" TEXT"
        );
        assert!(s.refresh.contains("to_tsvector($1::regconfig, coalesce(\"name\"::text, ''))"));
        assert!(s
            .refresh
            .ends_with("WHERE \"name_tsv_hash\" IS DISTINCT FROM md5(coalesce(\"name\"::text, ''))"));
        assert_eq!(
            s.create_index,
            "CREATE INDEX IF NOT EXISTS \"product_name_tsv_idx\" ON \"product\" USING GIN (\"name_tsv\")"
        );
        assert!(s.reindex.is_none());
    }

    #[test]
    fn test_force_refreshes_everything_and_reindexes() {
        let s = column_statements("product", "name", true).unwrap();
        assert!(!s.refresh.contains("WHERE"));
        assert_eq!(s.reindex.as_deref(), Some("REINDEX INDEX \"product_name_tsv_idx\""));
    }

    #[test]
    fn test_rejects_unsafe_column_names() {
        assert!(column_statements("product", "name; DROP", false).is_err());
    }

    #[test]
    fn test_search_ranks_matches_on_the_search_vector() {
        let sql = search_sql("product", "id", "name").unwrap();

        assert!(sql.starts_with(
            "SELECT \"id\"::text, \"name\"::text, ts_rank(\"name_tsv\", q)::float8 AS rank"
        ));
        assert!(sql.contains("FROM \"product\", plainto_tsquery($1::regconfig, $2) AS q"));
        assert!(sql.ends_with("WHERE \"name_tsv\" @@ q ORDER BY rank DESC, \"id\" LIMIT $3"));
        assert!(search_sql("product", "id", "name\"--").is_err());
    }
}
