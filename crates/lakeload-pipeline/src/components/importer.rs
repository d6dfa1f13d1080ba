//! Column-file importer
//!
//! Every file of an entity is fetched, decoded and upserted into one table
//! named after the entity. Rows are keyed on `id` when the file has one
//! (stored as text so large numeric ids survive); otherwise on `_row_key`,
//! a SHA-256 of the row's values, so re-importing the same batch is a no-op.

use async_trait::async_trait;
use lakeload_common::checksum::sha256_fields;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{
    information_schema_name, select_text_columns, table_columns, EntityData, ImportSummary,
    PipelineComponent, StageOutcome,
};
use crate::columnar::{decode_parquet, ColumnSpec, DecodedFile};
use crate::context::RunContext;
use crate::db::gateway::quote_ident;
use crate::db::{Gateway, SqlType, SqlValue};
use crate::discovery::{EntityRef, FileRef, StorageDiscovery};
use crate::error::{ImportError, PipelineError, QueryError};

pub const COMPONENT_NAME: &str = "importer";
pub const ID_COLUMN: &str = "id";
pub const ROW_KEY_COLUMN: &str = "_row_key";

/// Rows ready for loading, with the key column first when it was derived
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRows {
    pub columns: Vec<ColumnSpec>,
    pub key_column: String,
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows dropped because their `id` was null
    pub null_keys: usize,
    /// Earlier rows replaced by a later row with the same key
    pub duplicates: usize,
}

/// Apply the key rules and de-duplicate on the key (last row wins)
///
/// A file without `id` that already carries a `_row_key` column is rejected,
/// since the derived key would shadow it.
pub fn prepare_rows(table: &str, decoded: DecodedFile) -> Result<PreparedRows, ImportError> {
    let DecodedFile { mut columns, rows } = decoded;

    let has_id = columns.iter().any(|c| c.name == ID_COLUMN);
    if !has_id && columns.iter().any(|c| c.name == ROW_KEY_COLUMN) {
        return Err(ImportError::SchemaMismatch {
            table: table.to_string(),
            message: format!(
                "file has no '{}' column but already has '{}', which is reserved for the derived row key",
                ID_COLUMN, ROW_KEY_COLUMN
            ),
        });
    }

    let (key_index, key_column, rows) = match columns.iter().position(|c| c.name == ID_COLUMN) {
        Some(index) => {
            columns[index].sql_type = SqlType::Text;
            let rows = rows
                .into_iter()
                .map(|mut row| {
                    row[index] = match row[index].canonical() {
                        Some(text) => SqlValue::Text(text),
                        None => SqlValue::Null(SqlType::Text),
                    };
                    row
                })
                .collect::<Vec<_>>();
            (index, ID_COLUMN.to_string(), rows)
        },
        None => {
            columns.insert(0, ColumnSpec::new(ROW_KEY_COLUMN, SqlType::Text));
            let rows = rows
                .into_iter()
                .map(|row| {
                    let canonical: Vec<Option<String>> = row.iter().map(SqlValue::canonical).collect();
                    let key = sha256_fields(canonical.iter().map(|v| v.as_deref()));
                    let mut keyed = Vec::with_capacity(row.len() + 1);
                    keyed.push(SqlValue::Text(key));
                    keyed.extend(row);
                    keyed
                })
                .collect::<Vec<_>>();
            (0, ROW_KEY_COLUMN.to_string(), rows)
        },
    };

    let mut positions: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<Vec<SqlValue>> = Vec::with_capacity(rows.len());
    let mut null_keys = 0;
    let mut duplicates = 0;

    for row in rows {
        let Some(key) = row[key_index].canonical() else {
            null_keys += 1;
            continue;
        };
        match positions.get(&key) {
            Some(&at) => {
                unique[at] = row;
                duplicates += 1;
            },
            None => {
                positions.insert(key, unique.len());
                unique.push(row);
            },
        }
    }

    Ok(PreparedRows {
        columns,
        key_column,
        rows: unique,
        null_keys,
        duplicates,
    })
}

/// An existing table must already have every column of the file, with a
/// matching type
pub fn check_schema(
    table: &str,
    existing: &[(String, String)],
    wanted: &[ColumnSpec],
) -> Result<(), ImportError> {
    let mut problems = Vec::new();

    for column in wanted {
        match existing.iter().find(|(name, _)| *name == column.name) {
            None => problems.push(format!("missing column '{}'", column.name)),
            Some((_, data_type)) if data_type != information_schema_name(column.sql_type) => {
                problems.push(format!(
                    "column '{}' is {} but the file has {}",
                    column.name, data_type, column.sql_type
                ))
            },
            Some(_) => {},
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ImportError::SchemaMismatch {
            table: table.to_string(),
            message: problems.join("; "),
        })
    }
}

pub fn create_table_sql(
    table: &str,
    columns: &[ColumnSpec],
    key_column: &str,
) -> Result<String, QueryError> {
    let definitions = columns
        .iter()
        .map(|c| {
            let primary = if c.name == key_column { " PRIMARY KEY" } else { "" };
            Ok(format!("{} {}{}", quote_ident(&c.name)?, c.sql_type, primary))
        })
        .collect::<Result<Vec<_>, QueryError>>()?;

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table)?,
        definitions.join(", ")
    ))
}

struct FileImport {
    rows: u64,
    columns: Vec<ColumnSpec>,
    key_column: String,
}

pub struct Importer {
    discovery: Arc<StorageDiscovery>,
    gateway: Arc<Gateway>,
    max_text_columns: usize,
}

impl Importer {
    pub fn new(
        discovery: Arc<StorageDiscovery>,
        gateway: Arc<Gateway>,
        max_text_columns: usize,
    ) -> Self {
        Self {
            discovery,
            gateway,
            max_text_columns,
        }
    }

    async fn ensure_table(
        &self,
        ctx: &RunContext,
        table: &str,
        prepared: &PreparedRows,
    ) -> Result<(), ImportError> {
        let existing = table_columns(&self.gateway, ctx, table).await?;

        if existing.is_empty() {
            let sql = create_table_sql(table, &prepared.columns, &prepared.key_column)?;
            self.gateway.execute(ctx, &sql, Vec::new()).await?;
            info!("Created table {} ({} columns)", table, prepared.columns.len());
            return Ok(());
        }

        check_schema(table, &existing, &prepared.columns)
    }

    #[instrument(skip(self, ctx, file), fields(path = %file.path))]
    async fn import_file(
        &self,
        ctx: &RunContext,
        table: &str,
        file: &FileRef,
    ) -> Result<FileImport, ImportError> {
        let data = self
            .discovery
            .fetch(file, &ctx.cancel)
            .await
            .map_err(ImportError::Fetch)?;

        let decoded = tokio::task::spawn_blocking(move || decode_parquet(data))
            .await
            .map_err(|e| ImportError::Decode {
                path: file.path.clone(),
                message: format!("decode task failed: {}", e),
            })?
            .map_err(|e| ImportError::Decode {
                path: file.path.clone(),
                message: e.to_string(),
            })?;

        let prepared = prepare_rows(table, decoded)?;
        if prepared.null_keys > 0 {
            warn!("{}: dropped {} rows with a null id", file.path, prepared.null_keys);
        }
        if prepared.duplicates > 0 {
            debug!("{}: {} duplicate keys collapsed", file.path, prepared.duplicates);
        }

        self.ensure_table(ctx, table, &prepared).await?;

        let column_names: Vec<String> = prepared.columns.iter().map(|c| c.name.clone()).collect();
        let rows = self
            .gateway
            .bulk_load(
                ctx,
                table,
                &column_names,
                prepared.rows,
                Some(&prepared.key_column),
            )
            .await?;

        Ok(FileImport {
            rows,
            columns: prepared.columns,
            key_column: prepared.key_column,
        })
    }
}

fn is_fatal(err: &ImportError) -> bool {
    match err {
        ImportError::Load(e) => e.pool_exhausted,
        ImportError::Query(e) => e.is_run_fatal(),
        _ => false,
    }
}

#[async_trait]
impl PipelineComponent for Importer {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    async fn process_entity(
        &self,
        ctx: &RunContext,
        entity: &EntityRef,
        data: &mut EntityData,
    ) -> Result<StageOutcome, PipelineError> {
        let files = &entity.source_file_refs;
        let table = entity.name.as_str();

        if files.is_empty() {
            return Ok(StageOutcome::failure(
                format!("no column files under {}", entity.prefix),
                None,
            ));
        }

        if ctx.dry_run {
            let bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
            return Ok(StageOutcome::skipped(format!(
                "would import {} file(s) ({} bytes) into table '{}'",
                files.len(),
                bytes,
                table
            )));
        }

        let mut rows = 0u64;
        let mut succeeded: Vec<String> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut layout: Option<(Vec<ColumnSpec>, String)> = None;

        for file in files {
            if ctx.is_cancelled() {
                failed.push((file.path.clone(), "run cancelled".to_string()));
                continue;
            }

            match self.import_file(ctx, table, file).await {
                Ok(import) => {
                    rows += import.rows;
                    succeeded.push(file.path.clone());
                    layout.get_or_insert((import.columns, import.key_column));
                },
                Err(err) if is_fatal(&err) => return Err(err.into()),
                Err(err) => {
                    warn!("✗ {}: {}", file.path, err);
                    if let ImportError::Load(load) = &err {
                        rows += load.rows_loaded;
                    }
                    failed.push((file.path.clone(), err.to_string()));
                },
            }
        }

        if let Some((columns, key_column)) = layout {
            let text_columns =
                select_text_columns(&columns, &key_column, None, self.max_text_columns);
            data.import = Some(ImportSummary {
                table: table.to_string(),
                key_column,
                columns,
                text_columns,
                rows,
                files_loaded: succeeded.clone(),
            });
        }

        if failed.is_empty() {
            Ok(StageOutcome::success(
                format!(
                    "imported {} rows from {} file(s) into '{}'",
                    rows,
                    succeeded.len(),
                    table
                ),
                Some(rows),
            ))
        } else {
            let (first_path, first_error) = &failed[0];
            Ok(StageOutcome::failure(
                format!(
                    "{} of {} file(s) failed (first: {}: {}); succeeded: [{}]",
                    failed.len(),
                    files.len(),
                    first_path,
                    first_error,
                    succeeded.join(", ")
                ),
                Some(rows),
            ))
        }
    }
}
