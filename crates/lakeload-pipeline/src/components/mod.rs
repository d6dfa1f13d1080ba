//! Pipeline components
//!
//! A component processes one entity at a time. Expected per-entity problems
//! come back as a `failure` [`StageOutcome`]; only unexpected faults are
//! returned as [`PipelineError`], which the orchestrator converts into a
//! failure record (or a run halt, for pool exhaustion).
//!
//! Stages hand data forward through [`EntityData`]: the importer records the
//! table, key column and text columns it produced, and later stages read them
//! instead of re-inspecting the table.

use async_trait::async_trait;
use sqlx::Row;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::columnar::ColumnSpec;
use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::db::gateway::quote_ident;
use crate::db::{Gateway, SqlType, SqlValue};
use crate::discovery::{EntityRef, StorageDiscovery};
use crate::embedding::Embedder;
use crate::error::{PipelineError, QueryError};
use crate::orchestrator::ChainLink;
use crate::report::StageStatus;

pub mod embeddings;
pub mod fts;
pub mod importer;

pub use embeddings::EmbeddingGenerator;
pub use fts::FtsIndexer;
pub use importer::Importer;

/// Columns preferred for embedding and search, in priority order
pub const PREFERRED_TEXT_COLUMNS: &[&str] = &["name", "description", "title", "summary", "content"];

/// Suffixes of columns this pipeline derives itself
const DERIVED_SUFFIXES: &[&str] = &["_embedding", "_tsv", "_tsv_hash"];

/// What a component reports for one entity; the orchestrator adds identity
/// and timing to produce a [`crate::report::StageResult`]
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub message: String,
    pub rows_affected: Option<u64>,
}

impl StageOutcome {
    pub fn success(message: impl Into<String>, rows_affected: Option<u64>) -> Self {
        Self {
            status: StageStatus::Success,
            message: message.into(),
            rows_affected,
        }
    }

    pub fn failure(message: impl Into<String>, rows_affected: Option<u64>) -> Self {
        Self {
            status: StageStatus::Failure,
            message: message.into(),
            rows_affected,
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            message: message.into(),
            rows_affected: None,
        }
    }
}

/// What the importer produced for an entity
#[derive(Debug, Clone, PartialEq)]
pub struct ImportSummary {
    pub table: String,
    pub key_column: String,
    pub columns: Vec<ColumnSpec>,
    pub text_columns: Vec<String>,
    pub rows: u64,
    pub files_loaded: Vec<String>,
}

/// Payload passed along an entity's component chain
#[derive(Debug, Clone, Default)]
pub struct EntityData {
    pub import: Option<ImportSummary>,
    /// Free-form notes for user-defined components
    pub extras: BTreeMap<String, serde_json::Value>,
}

#[async_trait]
pub trait PipelineComponent: Send + Sync {
    fn name(&self) -> &str;

    async fn process_entity(
        &self,
        ctx: &RunContext,
        entity: &EntityRef,
        data: &mut EntityData,
    ) -> Result<StageOutcome, PipelineError>;
}

fn is_derived(column: &str) -> bool {
    DERIVED_SUFFIXES.iter().any(|suffix| column.ends_with(suffix))
}

/// Pick the text columns to embed or index
///
/// An explicit list wins (filtered to columns that exist). Otherwise the
/// preferred names present in the table, else the first `max` text columns.
pub fn select_text_columns(
    columns: &[ColumnSpec],
    key_column: &str,
    explicit: Option<&[String]>,
    max: usize,
) -> Vec<String> {
    let candidates: Vec<&str> = columns
        .iter()
        .filter(|c| c.sql_type.is_text() && c.name != key_column && !is_derived(&c.name))
        .map(|c| c.name.as_str())
        .collect();

    if let Some(explicit) = explicit {
        return explicit
            .iter()
            .filter(|name| candidates.contains(&name.as_str()))
            .cloned()
            .collect();
    }

    let preferred: Vec<String> = PREFERRED_TEXT_COLUMNS
        .iter()
        .filter(|name| candidates.contains(name))
        .map(|name| name.to_string())
        .collect();
    if !preferred.is_empty() {
        return preferred;
    }

    candidates.into_iter().take(max).map(str::to_string).collect()
}

fn sql_type_from_information_schema(data_type: &str) -> SqlType {
    match data_type {
        "boolean" => SqlType::Boolean,
        "bigint" | "integer" | "smallint" => SqlType::BigInt,
        "double precision" | "real" | "numeric" => SqlType::Double,
        "date" => SqlType::Date,
        "timestamp with time zone" | "timestamp without time zone" => SqlType::TimestampTz,
        "ARRAY" => SqlType::TextArray,
        _ => SqlType::Text,
    }
}

/// Spelling `information_schema.columns.data_type` uses for our types
pub fn information_schema_name(sql_type: SqlType) -> &'static str {
    match sql_type {
        SqlType::Boolean => "boolean",
        SqlType::BigInt => "bigint",
        SqlType::Double => "double precision",
        SqlType::Date => "date",
        SqlType::TimestampTz => "timestamp with time zone",
        SqlType::TextArray => "ARRAY",
        SqlType::Text => "text",
    }
}

/// Current columns of `table` as `(name, information_schema data_type)`
pub async fn table_columns(
    gateway: &Gateway,
    ctx: &RunContext,
    table: &str,
) -> Result<Vec<(String, String)>, QueryError> {
    let rows = gateway
        .fetch_all(
            ctx,
            "SELECT column_name::text, data_type::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
            vec![SqlValue::from(table)],
        )
        .await?;

    rows.iter()
        .map(|row| {
            let name: String = row.try_get(0).map_err(decode_err)?;
            let data_type: String = row.try_get(1).map_err(decode_err)?;
            Ok((name, data_type))
        })
        .collect()
}

fn decode_err(err: sqlx::Error) -> QueryError {
    QueryError::Database {
        kind: crate::error::FailureKind::Permanent,
        attempts: 1,
        message: err.to_string(),
    }
}

/// Table layout needed by the enrichment stages
#[derive(Debug, Clone, PartialEq)]
pub struct TableTarget {
    pub table: String,
    pub key_column: String,
    pub text_columns: Vec<String>,
}

/// Resolve the table to enrich, from the importer's summary when present,
/// otherwise by inspecting the live table. `None` when the table is missing.
pub async fn resolve_target(
    gateway: &Gateway,
    ctx: &RunContext,
    entity: &EntityRef,
    data: &EntityData,
    explicit: Option<&[String]>,
    max_text_columns: usize,
) -> Result<Option<TableTarget>, QueryError> {
    if let Some(import) = &data.import {
        let text_columns = match explicit {
            Some(_) => select_text_columns(
                &import.columns,
                &import.key_column,
                explicit,
                max_text_columns,
            ),
            None => import.text_columns.clone(),
        };
        return Ok(Some(TableTarget {
            table: import.table.clone(),
            key_column: import.key_column.clone(),
            text_columns,
        }));
    }

    if ctx.dry_run {
        return Ok(None);
    }

    quote_ident(&entity.name)?;
    let existing = table_columns(gateway, ctx, &entity.name).await?;
    if existing.is_empty() {
        return Ok(None);
    }

    let columns: Vec<ColumnSpec> = existing
        .iter()
        .map(|(name, ty)| ColumnSpec::new(name.clone(), sql_type_from_information_schema(ty)))
        .collect();
    let key_column = if columns.iter().any(|c| c.name == importer::ID_COLUMN) {
        importer::ID_COLUMN
    } else {
        importer::ROW_KEY_COLUMN
    };

    Ok(Some(TableTarget {
        table: entity.name.clone(),
        key_column: key_column.to_string(),
        text_columns: select_text_columns(&columns, key_column, explicit, max_text_columns),
    }))
}

/// The standard chain: import, embed, index
///
/// Stages named in `run.optional_stages` are marked optional. Whether the
/// embedding stage runs at all is decided per run by `skip_embeddings`.
pub fn default_chain(
    config: &PipelineConfig,
    discovery: Arc<StorageDiscovery>,
    gateway: Arc<Gateway>,
    embedder: Arc<dyn Embedder>,
) -> Vec<ChainLink> {
    let required = |name: &str| !config.run.optional_stages.iter().any(|s| s == name);

    vec![
        ChainLink::new(
            Arc::new(Importer::new(
                discovery,
                gateway.clone(),
                config.embedding.max_text_columns,
            )),
            required(importer::COMPONENT_NAME),
        ),
        ChainLink::new(
            Arc::new(EmbeddingGenerator::new(
                gateway.clone(),
                embedder,
                config.embedding.clone(),
            )),
            required(embeddings::COMPONENT_NAME),
        ),
        ChainLink::new(
            Arc::new(FtsIndexer::new(gateway, config.fts.clone())),
            required(fts::COMPONENT_NAME),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(specs: &[(&str, SqlType)]) -> Vec<ColumnSpec> {
        specs.iter().map(|(n, t)| ColumnSpec::new(*n, *t)).collect()
    }

    #[test]
    fn test_preferred_columns_win() {
        let columns = cols(&[
            ("id", SqlType::Text),
            ("sku", SqlType::Text),
            ("description", SqlType::Text),
            ("name", SqlType::Text),
            ("price", SqlType::Double),
        ]);
        assert_eq!(
            select_text_columns(&columns, "id", None, 3),
            vec!["name", "description"]
        );
    }

    #[test]
    fn test_fallback_takes_first_text_columns() {
        let columns = cols(&[
            ("id", SqlType::Text),
            ("a", SqlType::Text),
            ("n", SqlType::BigInt),
            ("b", SqlType::Text),
            ("c", SqlType::Text),
            ("d", SqlType::Text),
            ("a_embedding", SqlType::Text),
        ]);
        assert_eq!(select_text_columns(&columns, "id", None, 3), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_explicit_columns_filtered_to_existing_text() {
        let columns = cols(&[
            ("id", SqlType::Text),
            ("notes", SqlType::Text),
            ("qty", SqlType::BigInt),
        ]);
        let explicit = vec!["notes".to_string(), "qty".to_string(), "ghost".to_string()];
        assert_eq!(
            select_text_columns(&columns, "id", Some(&explicit), 3),
            vec!["notes"]
        );
    }

    #[test]
    fn test_information_schema_round_trip() {
        for ty in [
            SqlType::Boolean,
            SqlType::BigInt,
            SqlType::Double,
            SqlType::Date,
            SqlType::TimestampTz,
            SqlType::TextArray,
            SqlType::Text,
        ] {
            assert_eq!(sql_type_from_information_schema(information_schema_name(ty)), ty);
        }
    }
}
