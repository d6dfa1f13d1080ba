//! Embedding generation for imported text columns
//!
//! Each text column `c` gets a sibling `c_embedding`. Only rows with text and
//! no stored vector are sent to the embedder, so a second run over unchanged
//! data touches nothing. Vectors use pgvector when the extension can be
//! created and fall back to `REAL[]` otherwise.

use async_trait::async_trait;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{resolve_target, table_columns, EntityData, PipelineComponent, StageOutcome, TableTarget};
use crate::context::RunContext;
use crate::db::gateway::quote_ident;
use crate::db::{Gateway, SqlValue};
use crate::discovery::EntityRef;
use crate::embedding::{Embedder, EmbeddingConfig};
use crate::error::{EmbeddingError, FailureKind, PipelineError, QueryError};

pub const COMPONENT_NAME: &str = "embedding_generator";

pub const EMBEDDING_SUFFIX: &str = "_embedding";

/// Column type used to hold vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorStorage {
    Pgvector,
    RealArray,
}

impl VectorStorage {
    pub fn column_type(&self, dimension: usize) -> String {
        match self {
            VectorStorage::Pgvector => format!("vector({})", dimension),
            VectorStorage::RealArray => "REAL[]".to_string(),
        }
    }

    fn cast(&self) -> &'static str {
        match self {
            VectorStorage::Pgvector => "vector",
            VectorStorage::RealArray => "real[]",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VectorStorage::Pgvector => "pgvector",
            VectorStorage::RealArray => "REAL[] (vector extension unavailable)",
        }
    }

    /// Text literal accepted by the matching cast
    pub fn format(&self, vector: &[f32]) -> String {
        let body = vector
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        match self {
            VectorStorage::Pgvector => format!("[{}]", body),
            VectorStorage::RealArray => format!("{{{}}}", body),
        }
    }

    /// Storage of an existing column, from its information_schema data type
    fn from_data_type(data_type: &str) -> Option<Self> {
        match data_type {
            "USER-DEFINED" => Some(VectorStorage::Pgvector),
            "ARRAY" => Some(VectorStorage::RealArray),
            _ => None,
        }
    }
}

pub fn select_pending_sql(
    target: &TableTarget,
    column: &str,
    force: bool,
) -> Result<String, QueryError> {
    let table = quote_ident(&target.table)?;
    let key = quote_ident(&target.key_column)?;
    let text = quote_ident(column)?;
    let embedding = quote_ident(&format!("{}{}", column, EMBEDDING_SUFFIX))?;

    let pending = if force {
        String::new()
    } else {
        format!(" AND {} IS NULL", embedding)
    };

    Ok(format!(
        "SELECT {key}::text, {text}::text FROM {table} \
         WHERE {text} IS NOT NULL AND btrim({text}::text) <> ''{pending} ORDER BY {key}"
    ))
}

pub fn update_vectors_sql(
    target: &TableTarget,
    column: &str,
    storage: VectorStorage,
) -> Result<String, QueryError> {
    let table = quote_ident(&target.table)?;
    let key = quote_ident(&target.key_column)?;
    let embedding = quote_ident(&format!("{}{}", column, EMBEDDING_SUFFIX))?;

    Ok(format!(
        "UPDATE {table} AS t SET {embedding} = v.emb::{cast} \
         FROM UNNEST($1::text[], $2::text[]) AS v(key, emb) WHERE t.{key} = v.key",
        cast = storage.cast()
    ))
}

#[derive(Debug, Default)]
struct ColumnReport {
    embedded: u64,
    failed_batches: usize,
    first_error: Option<String>,
}

pub struct EmbeddingGenerator {
    gateway: Arc<Gateway>,
    embedder: Arc<dyn Embedder>,
    config: EmbeddingConfig,
    storage: OnceCell<VectorStorage>,
}

impl EmbeddingGenerator {
    pub fn new(gateway: Arc<Gateway>, embedder: Arc<dyn Embedder>, config: EmbeddingConfig) -> Self {
        Self {
            gateway,
            embedder,
            config,
            storage: OnceCell::new(),
        }
    }

    /// Detect pgvector once per run
    async fn default_storage(&self, ctx: &RunContext) -> Result<VectorStorage, QueryError> {
        self.storage
            .get_or_try_init(|| async {
                match self
                    .gateway
                    .execute(ctx, "CREATE EXTENSION IF NOT EXISTS vector", Vec::new())
                    .await
                {
                    Ok(_) => Ok(VectorStorage::Pgvector),
                    Err(e) if e.is_run_fatal() || e.kind() == FailureKind::Cancelled => Err(e),
                    Err(e) => {
                        warn!("vector extension unavailable, storing embeddings as REAL[]: {}", e);
                        Ok(VectorStorage::RealArray)
                    },
                }
            })
            .await
            .copied()
    }

    async fn embed_column(
        &self,
        ctx: &RunContext,
        target: &TableTarget,
        column: &str,
        storage: VectorStorage,
    ) -> Result<ColumnReport, QueryError> {
        let embedding_column = format!("{}{}", column, EMBEDDING_SUFFIX);
        let alter = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            quote_ident(&target.table)?,
            quote_ident(&embedding_column)?,
            storage.column_type(self.embedder.dimension())
        );
        self.gateway.execute(ctx, &alter, Vec::new()).await?;

        let rows = self
            .gateway
            .fetch_all(ctx, &select_pending_sql(target, column, ctx.force)?, Vec::new())
            .await?;
        let pending = rows
            .iter()
            .map(|row| Ok((row.try_get::<String, _>(0)?, row.try_get::<String, _>(1)?)))
            .collect::<Result<Vec<(String, String)>, sqlx::Error>>()
            .map_err(|e| QueryError::Database {
                kind: FailureKind::Permanent,
                attempts: 1,
                message: e.to_string(),
            })?;

        debug!("{}.{}: {} row(s) need embeddings", target.table, column, pending.len());

        let update = update_vectors_sql(target, column, storage)?;
        let mut report = ColumnReport::default();
        let batch_size = self.config.batch_size.max(1);

        for (index, chunk) in pending.chunks(batch_size).enumerate() {
            if ctx.is_cancelled() {
                report.failed_batches += 1;
                report.first_error.get_or_insert_with(|| "run cancelled".to_string());
                break;
            }

            let texts: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
            let vectors = match self.embedder.embed(&texts, &ctx.cancel).await {
                Ok(vectors) if vectors.len() == texts.len() => vectors,
                Ok(vectors) => {
                    let err = EmbeddingError::CountMismatch {
                        expected: texts.len(),
                        got: vectors.len(),
                    };
                    warn!("{}.{}: batch {} rejected: {}", target.table, column, index, err);
                    report.failed_batches += 1;
                    report.first_error.get_or_insert_with(|| err.to_string());
                    continue;
                },
                Err(err) => {
                    warn!("{}.{}: batch {} failed: {}", target.table, column, index, err);
                    report.failed_batches += 1;
                    report.first_error.get_or_insert_with(|| err.to_string());
                    continue;
                },
            };

            let keys: Vec<String> = chunk.iter().map(|(key, _)| key.clone()).collect();
            let literals: Vec<String> = vectors.iter().map(|v| storage.format(v)).collect();

            match self
                .gateway
                .execute(
                    ctx,
                    &update,
                    vec![SqlValue::TextArray(keys), SqlValue::TextArray(literals)],
                )
                .await
            {
                Ok(updated) => report.embedded += updated,
                Err(e) if e.is_run_fatal() => return Err(e),
                Err(e) => {
                    warn!("{}.{}: writing batch {} failed: {}", target.table, column, index, e);
                    report.failed_batches += 1;
                    report.first_error.get_or_insert_with(|| e.to_string());
                },
            }
        }

        if storage == VectorStorage::Pgvector && report.embedded > 0 {
            self.build_ann_index(ctx, target, &embedding_column).await?;
        }

        Ok(report)
    }

    async fn build_ann_index(
        &self,
        ctx: &RunContext,
        target: &TableTarget,
        embedding_column: &str,
    ) -> Result<(), QueryError> {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING ivfflat ({} vector_cosine_ops)",
            quote_ident(&format!("{}_{}_idx", target.table, embedding_column))?,
            quote_ident(&target.table)?,
            quote_ident(embedding_column)?
        );
        match self.gateway.execute(ctx, &sql, Vec::new()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_run_fatal() => Err(e),
            Err(e) => {
                warn!("{}: ivfflat index on {} not created: {}", target.table, embedding_column, e);
                Ok(())
            },
        }
    }
}

#[async_trait]
impl PipelineComponent for EmbeddingGenerator {
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
                "would embed text columns of '{}' with {} ({} dims)",
                entity.name,
                self.embedder.model(),
                self.embedder.dimension()
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
                "no text columns to embed in '{}'",
                target.table
            )));
        }

        let default_storage = self.default_storage(ctx).await?;
        let existing = table_columns(&self.gateway, ctx, &target.table).await?;

        let mut embedded = 0u64;
        let mut failed_batches = 0usize;
        let mut first_error: Option<String> = None;
        let mut storages = Vec::new();

        for column in &target.text_columns {
            let embedding_column = format!("{}{}", column, EMBEDDING_SUFFIX);
            let storage = existing
                .iter()
                .find(|(name, _)| *name == embedding_column)
                .and_then(|(_, data_type)| VectorStorage::from_data_type(data_type))
                .unwrap_or(default_storage);
            if !storages.contains(&storage) {
                storages.push(storage);
            }

            let report = self.embed_column(ctx, &target, column, storage).await?;
            embedded += report.embedded;
            failed_batches += report.failed_batches;
            if first_error.is_none() {
                first_error = report.first_error;
            }
        }

        let storage_label = storages
            .iter()
            .map(|s| s.label())
            .collect::<Vec<_>>()
            .join(", ");
        let columns = target.text_columns.join(", ");

        if failed_batches > 0 {
            return Ok(StageOutcome::failure(
                format!(
                    "{} batch(es) failed for [{}] in '{}' (first: {}); {} row(s) embedded using {}",
                    failed_batches,
                    columns,
                    target.table,
                    first_error.unwrap_or_default(),
                    embedded,
                    storage_label
                ),
                Some(embedded),
            ));
        }

        info!("{}: embedded {} row(s) across [{}]", target.table, embedded, columns);
        Ok(StageOutcome::success(
            format!(
                "embedded {} row(s) across [{}] in '{}' using {}",
                embedded, columns, target.table, storage_label
            ),
            Some(embedded),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TableTarget {
        TableTarget {
            table: "product".to_string(),
            key_column: "id".to_string(),
            text_columns: vec!["name".to_string()],
        }
    }

    #[test]
    fn test_vector_literals() {
        let v = [0.5f32, -1.0, 0.25];
        assert_eq!(VectorStorage::Pgvector.format(&v), "[0.5,-1,0.25]");
        assert_eq!(VectorStorage::RealArray.format(&v), "{0.5,-1,0.25}");
        assert_eq!(VectorStorage::Pgvector.column_type(384), "vector(384)");
    }

    #[test]
    fn test_pending_rows_skip_existing_vectors_unless_forced() {
        let sql = select_pending_sql(&target(), "name", false).unwrap();
        assert!(sql.contains("\"name_embedding\" IS NULL"));
        assert!(sql.contains("btrim(\"name\"::text) <> ''"));

        let forced = select_pending_sql(&target(), "name", true).unwrap();
        assert!(!forced.contains("IS NULL"));
    }

    #[test]
    fn test_update_is_keyed_by_row_identity() {
        let sql = update_vectors_sql(&target(), "name", VectorStorage::RealArray).unwrap();
        assert_eq!(
            sql,
            "UPDATE \"product\" AS t SET \"name_embedding\" = v.emb::real[] \
             FROM UNNEST($1::text[], $2::text[]) AS v(key, emb) WHERE t.\"id\" = v.key"
        );
    }

    #[test]
    fn test_existing_column_type_wins() {
        assert_eq!(VectorStorage::from_data_type("ARRAY"), Some(VectorStorage::RealArray));
        assert_eq!(VectorStorage::from_data_type("USER-DEFINED"), Some(VectorStorage::Pgvector));
        assert_eq!(VectorStorage::from_data_type("text"), None);
    }
}
