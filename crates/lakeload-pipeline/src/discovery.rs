//! Batch discovery
//!
//! Remote layout is `<root>/<date folder>/<entity folder>/*.parquet`. Date
//! folders must be named so that lexicographic order equals chronological
//! order (the default pattern is `YYYY-MM-DD-HH`); "latest" is simply the
//! greatest matching name. No date parsing is attempted, so a folder naming
//! scheme that does not sort correctly will silently pick the wrong batch.

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::DiscoveryError;
use crate::retry::RetryPolicy;
use crate::storage::{ObjectListing, ObjectStore};

/// Default date folder naming: `YYYY-MM-DD-HH`
pub const DEFAULT_DATE_FOLDER_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}-\d{2}$";

/// Suffix identifying column files
pub const COLUMN_FILE_SUFFIX: &str = ".parquet";

/// Plurals the simple suffix rule gets wrong
const SPECIAL_PLURALS: &[(&str, &str)] = &[
    ("products", "product"),
    ("spend_categories", "spend_category"),
    ("vendors", "vendor"),
    ("customers", "customer"),
    ("employees", "employee"),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Prefix inside the bucket that holds the date folders
    pub root_prefix: String,
    pub date_folder_pattern: String,
    /// Map plural folder names (`customers`) to singular table names
    pub singularize_entity_names: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root_prefix: String::new(),
            date_folder_pattern: DEFAULT_DATE_FOLDER_PATTERN.to_string(),
            singularize_entity_names: true,
        }
    }
}

/// A remote column file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub size_bytes: u64,
    pub etag: Option<String>,
}

/// One logical table within a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Table name; the entity filter matches this or `folder`
    pub name: String,
    /// Source folder name under the date folder
    pub folder: String,
    /// Full key prefix of the folder, ending in `/`
    pub prefix: String,
    pub source_file_refs: Vec<FileRef>,
}

/// Everything discovered for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub date_folder_id: String,
    /// e.g. `s3://bucket/exports/2025-04-14-09/`
    pub location: String,
    pub entities: Vec<EntityRef>,
}

impl Batch {
    pub fn entity_names(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.name.clone()).collect()
    }

    pub fn file_count(&self) -> usize {
        self.entities.iter().map(|e| e.source_file_refs.len()).sum()
    }
}

/// Map an entity folder name to its table name
pub fn table_name_for(folder: &str, singularize: bool) -> String {
    let lowered = folder.trim().to_lowercase();

    let mapped = if !singularize {
        lowered
    } else if let Some((_, singular)) = SPECIAL_PLURALS.iter().find(|(p, _)| *p == lowered) {
        singular.to_string()
    } else if lowered.len() > 1
        && lowered.ends_with('s')
        && !["ss", "us", "is"].iter().any(|end| lowered.ends_with(end))
    {
        lowered[..lowered.len() - 1].to_string()
    } else {
        lowered
    };

    sanitize_identifier(&mapped)
}

/// Reduce a name to `[a-z0-9_]`
pub fn sanitize_identifier(name: &str) -> String {
    let sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Last path segment of a prefix such as `exports/2025-04-14-09/`
fn last_segment(prefix: &str) -> &str {
    prefix
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// Locates batches and fetches their files, retrying transient storage errors
pub struct StorageDiscovery {
    store: Arc<dyn ObjectStore>,
    config: DiscoveryConfig,
    root: String,
    pattern: Regex,
    retry: RetryPolicy,
}

impl StorageDiscovery {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: DiscoveryConfig,
        retry: RetryPolicy,
    ) -> Result<Self, DiscoveryError> {
        let pattern = Regex::new(&config.date_folder_pattern).map_err(|e| {
            DiscoveryError::InvalidConfig(format!(
                "date folder pattern '{}': {}",
                config.date_folder_pattern, e
            ))
        })?;
        let root = normalize_root(&config.root_prefix);

        Ok(Self {
            store,
            config,
            root,
            pattern,
            retry,
        })
    }

    fn location(&self, prefix: &str) -> String {
        format!("{}/{}", self.store.location(), prefix)
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ObjectListing, DiscoveryError> {
        let operation = format!("list {}", prefix);
        self.retry
            .run(&operation, cancel, |_| self.store.list(prefix, delimiter))
            .await
            .map_err(|e| DiscoveryError::from_retry(prefix, e))
    }

    /// Pick the greatest date folder matching the naming pattern
    #[instrument(skip(self, cancel))]
    pub async fn find_latest_batch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Batch, DiscoveryError> {
        let listing = self.list(&self.root, Some("/"), cancel).await?;

        let latest = listing
            .prefixes
            .iter()
            .map(|p| last_segment(p))
            .filter(|name| {
                let matches = self.pattern.is_match(name);
                if !matches {
                    debug!("Ignoring non-matching folder '{}'", name);
                }
                matches
            })
            .max()
            .map(str::to_string)
            .ok_or_else(|| DiscoveryError::NoBatch {
                root: self.location(&self.root),
                pattern: self.config.date_folder_pattern.clone(),
            })?;

        info!("Latest date folder: {}", latest);
        self.find_batch(&latest, cancel).await
    }

    /// Discover the batch under a caller-chosen date folder
    #[instrument(skip(self, cancel))]
    pub async fn find_batch(
        &self,
        date_folder_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Batch, DiscoveryError> {
        let folder_id = date_folder_id.trim_matches('/');
        if folder_id.is_empty() {
            return Err(DiscoveryError::FolderNotFound(date_folder_id.to_string()));
        }
        if !self.pattern.is_match(folder_id) {
            warn!(
                "Date folder '{}' does not match pattern '{}'",
                folder_id, self.config.date_folder_pattern
            );
        }

        let date_prefix = format!("{}{}/", self.root, folder_id);
        let listing = self.list(&date_prefix, Some("/"), cancel).await?;

        if listing.prefixes.is_empty() && listing.objects.is_empty() {
            return Err(DiscoveryError::FolderNotFound(self.location(&date_prefix)));
        }

        let mut seen = HashSet::new();
        let mut entities = Vec::with_capacity(listing.prefixes.len());

        for prefix in &listing.prefixes {
            let folder = last_segment(prefix).to_string();
            let mut name = table_name_for(&folder, self.config.singularize_entity_names);

            if seen.contains(&name) {
                let raw = sanitize_identifier(&folder);
                if seen.contains(&raw) {
                    warn!("Skipping folder '{}': table name '{}' already taken", folder, name);
                    continue;
                }
                warn!(
                    "Folder '{}' maps to '{}' which is already taken; using '{}'",
                    folder, name, raw
                );
                name = raw;
            }
            seen.insert(name.clone());

            let mut entity = EntityRef {
                name,
                folder,
                prefix: prefix.clone(),
                source_file_refs: Vec::new(),
            };
            entity.source_file_refs = self.list_files(&entity, cancel).await?;
            entities.push(entity);
        }

        info!(
            "Discovered {} entities ({} files) in {}",
            entities.len(),
            entities.iter().map(|e| e.source_file_refs.len()).sum::<usize>(),
            self.location(&date_prefix)
        );

        Ok(Batch {
            date_folder_id: folder_id.to_string(),
            location: self.location(&date_prefix),
            entities,
        })
    }

    /// Column files directly under an entity folder, sorted by path
    ///
    /// Nested folders (e.g. a writer's `_temporary/`) are not descended into.
    pub async fn list_files(
        &self,
        entity: &EntityRef,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileRef>, DiscoveryError> {
        let listing = self.list(&entity.prefix, Some("/"), cancel).await?;
        for nested in &listing.prefixes {
            debug!("Skipping nested folder {}", nested);
        }

        let mut files: Vec<FileRef> = listing
            .objects
            .into_iter()
            .filter(|obj| {
                let keep = obj.key.ends_with(COLUMN_FILE_SUFFIX);
                if !keep {
                    debug!("Skipping non-column file {}", obj.key);
                }
                keep
            })
            .map(|obj| FileRef {
                path: obj.key,
                size_bytes: obj.size,
                etag: obj.etag,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(files)
    }

    /// Download one column file
    #[instrument(skip(self, cancel), fields(path = %file.path))]
    pub async fn fetch(
        &self,
        file: &FileRef,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DiscoveryError> {
        let operation = format!("fetch {}", file.path);
        let data = self
            .retry
            .run(&operation, cancel, |_| self.store.get(&file.path))
            .await
            .map_err(|e| DiscoveryError::from_retry(&file.path, e))?;

        debug!("Fetched {} ({} bytes)", file.path, data.len());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, StoreError};
    use crate::storage::MemoryObjectStore;
    use std::time::Duration;

    fn retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10)).without_jitter()
    }

    fn seeded_store() -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new("lake"));
        store.put("exports/2025-04-13-09/products/part-0.parquet", "old");
        store.put("exports/2025-04-14-09/products/part-1.parquet", "p1");
        store.put("exports/2025-04-14-09/products/part-0.parquet", "p0");
        store.put("exports/2025-04-14-09/products/_SUCCESS", "");
        store.put("exports/2025-04-14-09/products/_tmp/attempt-0.parquet", "partial");
        store.put("exports/2025-04-14-09/customers/part-0.snappy.parquet", "c0");
        store.put("exports/latest/products/part-0.parquet", "junk");
        store.put("exports/2025-04-14-1/products/part-0.parquet", "junk");
        store
    }

    fn discovery(store: Arc<MemoryObjectStore>) -> StorageDiscovery {
        let config = DiscoveryConfig {
            root_prefix: "exports".to_string(),
            ..DiscoveryConfig::default()
        };
        StorageDiscovery::new(store, config, retry()).unwrap()
    }

    #[test]
    fn test_table_name_mapping() {
        assert_eq!(table_name_for("products", true), "product");
        assert_eq!(table_name_for("spend_categories", true), "spend_category");
        assert_eq!(table_name_for("orders", true), "order");
        assert_eq!(table_name_for("address", true), "address");
        assert_eq!(table_name_for("status", true), "status");
        assert_eq!(table_name_for("analysis", true), "analysis");
        assert_eq!(table_name_for("Line-Items", true), "line_item");
        assert_eq!(table_name_for("products", false), "products");
    }

    #[tokio::test]
    async fn test_latest_batch_is_lexicographic_max_of_matching_folders() {
        let cancel = CancellationToken::new();
        let batch = discovery(seeded_store())
            .find_latest_batch(&cancel)
            .await
            .unwrap();

        assert_eq!(batch.date_folder_id, "2025-04-14-09");
        assert_eq!(batch.location, "memory://lake/exports/2025-04-14-09/");
        assert_eq!(batch.entity_names(), vec!["customer", "product"]);
    }

    #[tokio::test]
    async fn test_files_are_filtered_and_sorted() {
        let cancel = CancellationToken::new();
        let batch = discovery(seeded_store())
            .find_batch("2025-04-14-09", &cancel)
            .await
            .unwrap();

        let product = batch.entities.iter().find(|e| e.name == "product").unwrap();
        let paths: Vec<&str> = product.source_file_refs.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "exports/2025-04-14-09/products/part-0.parquet",
                "exports/2025-04-14-09/products/part-1.parquet",
            ]
        );
        assert_eq!(product.folder, "products");
        assert_eq!(batch.file_count(), 3);
    }

    #[tokio::test]
    async fn test_pinned_folder_missing() {
        let cancel = CancellationToken::new();
        let err = discovery(seeded_store())
            .find_batch("2024-01-01-00", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::FolderNotFound(_)));
    }

    #[tokio::test]
    async fn test_no_matching_folders() {
        let store = Arc::new(MemoryObjectStore::new("lake"));
        store.put("exports/tmp/x.parquet", "x");
        let cancel = CancellationToken::new();

        let err = discovery(store).find_latest_batch(&cancel).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NoBatch { .. }));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = DiscoveryConfig {
            date_folder_pattern: "([".to_string(),
            ..DiscoveryConfig::default()
        };
        let store = Arc::new(MemoryObjectStore::new("lake"));
        assert!(matches!(
            StorageDiscovery::new(store, config, retry()),
            Err(DiscoveryError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_retries_transient_errors() {
        let store = seeded_store();
        let key = "exports/2025-04-14-09/products/part-0.parquet";
        store.fail_next(key, 2, StoreError::transient("503 Service Unavailable"));
        let discovery = discovery(store.clone());
        let cancel = CancellationToken::new();

        let file = FileRef {
            path: key.to_string(),
            size_bytes: 2,
            etag: None,
        };
        let data = discovery.fetch(&file, &cancel).await.unwrap();

        assert_eq!(data, Bytes::from("p0"));
        assert_eq!(store.get_calls(key), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_exhaustion_tagged() {
        let store = seeded_store();
        let key = "exports/2025-04-14-09/products/part-0.parquet";
        store.fail_next(key, 10, StoreError::transient("connection reset"));
        let discovery = discovery(store.clone());
        let cancel = CancellationToken::new();

        let file = FileRef {
            path: key.to_string(),
            size_bytes: 2,
            etag: None,
        };
        let err = discovery.fetch(&file, &cancel).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::TransientExhausted);
        assert_eq!(store.get_calls(key), 3);
    }

    #[tokio::test]
    async fn test_fetch_missing_object_is_permanent_single_attempt() {
        let store = seeded_store();
        let discovery = discovery(store.clone());
        let cancel = CancellationToken::new();

        let file = FileRef {
            path: "exports/2025-04-14-09/products/gone.parquet".to_string(),
            size_bytes: 0,
            etag: None,
        };
        let err = discovery.fetch(&file, &cancel).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Permanent);
        assert_eq!(store.get_calls(&file.path), 1);
    }
}
