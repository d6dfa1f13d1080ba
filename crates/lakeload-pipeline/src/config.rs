//! Run configuration
//!
//! Resolution order, lowest to highest: compiled defaults, an optional TOML
//! file, environment variables (a `.env` file is loaded first), then CLI
//! flags applied by the binary.

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::components::fts::FtsConfig;
use crate::components::{embeddings, fts, importer};
use crate::db::DbConfig;
use crate::discovery::DiscoveryConfig;
use crate::embedding::{EmbeddingConfig, EmbeddingProvider};
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::storage::StorageConfig;

/// Default number of entities processed at once
pub const DEFAULT_CONCURRENCY: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunSettings {
    pub concurrency: usize,
    /// Components whose failure does not stop the rest of an entity's chain
    pub optional_stages: Vec<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            optional_stages: Vec::new(),
        }
    }
}

/// Fully resolved pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub database: DbConfig,
    pub discovery: DiscoveryConfig,
    pub retry: RetryPolicy,
    pub embedding: EmbeddingConfig,
    pub fts: FtsConfig,
    pub run: RunSettings,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(format!("{} has an invalid value '{}'", key, raw))),
        None => Ok(None),
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_var(key).map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

impl PipelineConfig {
    /// Defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let base = match path {
            Some(path) => Self::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Self::default(),
        };

        base.merge_env().context("Invalid environment configuration")
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::invalid(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Overlay storage, database and `LAKELOAD_*` environment variables
    pub fn merge_env(mut self) -> Result<Self, ConfigError> {
        self.storage = self.storage.merge_env();
        self.database = self.database.merge_env();

        if let Some(root) = env_var("LAKELOAD_ROOT_PREFIX") {
            self.discovery.root_prefix = root;
        }
        if let Some(pattern) = env_var("LAKELOAD_DATE_FOLDER_PATTERN") {
            self.discovery.date_folder_pattern = pattern;
        }
        if let Some(singularize) = env_parsed("LAKELOAD_SINGULARIZE_ENTITY_NAMES")? {
            self.discovery.singularize_entity_names = singularize;
        }

        if let Some(attempts) = env_parsed("LAKELOAD_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = attempts;
        }
        if let Some(base) = env_parsed("LAKELOAD_RETRY_BASE_DELAY_MS")? {
            self.retry.base_delay_ms = base;
        }
        if let Some(max) = env_parsed("LAKELOAD_RETRY_MAX_DELAY_MS")? {
            self.retry.max_delay_ms = max;
        }

        if let Some(provider) = env_var("LAKELOAD_EMBEDDING_PROVIDER") {
            self.embedding.provider = provider.parse::<EmbeddingProvider>()?;
        }
        if let Some(model) = env_var("LAKELOAD_EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(dimension) = env_parsed("LAKELOAD_EMBEDDING_DIMENSION")? {
            self.embedding.dimension = dimension;
        }
        if let Some(endpoint) = env_var("LAKELOAD_EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = Some(endpoint);
        }
        if let Some(key) = env_var("LAKELOAD_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(key);
        }
        if let Some(batch) = env_parsed("LAKELOAD_EMBEDDING_BATCH_SIZE")? {
            self.embedding.batch_size = batch;
        }
        if let Some(columns) = env_list("LAKELOAD_EMBEDDING_TEXT_COLUMNS") {
            self.embedding.text_columns = Some(columns);
        }

        if let Some(language) = env_var("LAKELOAD_FTS_LANGUAGE") {
            self.fts.language = language;
        }
        if let Some(columns) = env_list("LAKELOAD_FTS_TEXT_COLUMNS") {
            self.fts.text_columns = Some(columns);
        }

        if let Some(concurrency) = env_parsed("LAKELOAD_CONCURRENCY")? {
            self.run.concurrency = concurrency;
        }
        if let Some(stages) = env_list("LAKELOAD_OPTIONAL_STAGES") {
            self.run.optional_stages = stages;
        }

        Ok(self)
    }

    /// Reject settings the pipeline cannot run with
    ///
    /// A dry run never touches the database, so it does not need a URL.
    pub fn validate(&self, dry_run: bool) -> Result<(), ConfigError> {
        if self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::invalid("storage bucket cannot be empty (S3_BUCKET)"));
        }

        if !dry_run && self.database.url.trim().is_empty() {
            return Err(ConfigError::invalid("database URL cannot be empty (DATABASE_URL)"));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid("database max_connections must be greater than 0"));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::invalid(format!(
                "database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if self.database.bulk_batch_rows == 0 {
            return Err(ConfigError::invalid("database bulk_batch_rows must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry max_attempts must be at least 1"));
        }

        if self.discovery.date_folder_pattern.trim().is_empty() {
            return Err(ConfigError::invalid("discovery date_folder_pattern cannot be empty"));
        }
        Regex::new(&self.discovery.date_folder_pattern).map_err(|e| {
            ConfigError::invalid(format!(
                "discovery date_folder_pattern '{}' is not a valid regex: {}",
                self.discovery.date_folder_pattern, e
            ))
        })?;

        if self.embedding.batch_size == 0 {
            return Err(ConfigError::invalid("embedding batch_size must be greater than 0"));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::invalid("embedding dimension must be greater than 0"));
        }
        if self.embedding.provider == EmbeddingProvider::Http && self.embedding.endpoint.is_none() {
            return Err(ConfigError::invalid(
                "embedding endpoint is required for the http provider",
            ));
        }

        if self.fts.language.is_empty()
            || !self.fts.language.chars().all(|c| c.is_ascii_lowercase() || c == '_')
        {
            return Err(ConfigError::invalid(format!(
                "fts language '{}' is not a text search configuration name",
                self.fts.language
            )));
        }

        if self.run.concurrency == 0 {
            return Err(ConfigError::invalid("run concurrency must be greater than 0"));
        }

        let known = [importer::COMPONENT_NAME, embeddings::COMPONENT_NAME, fts::COMPONENT_NAME];
        for stage in &self.run.optional_stages {
            if !known.contains(&stage.as_str()) {
                tracing::warn!("Unknown stage '{}' in run.optional_stages", stage);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn valid() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.storage.bucket = "lake".to_string();
        config.database.url = "postgres://localhost/lakeload".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.run.concurrency, 1);
        assert_eq!(config.fts.language, "english");
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.discovery.singularize_entity_names);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [storage]
            bucket = "exports"

            [discovery]
            root_prefix = "daily"

            [embedding]
            provider = "http"
            endpoint = "http://localhost:8080/v1/embeddings"
            dimension = 768

            [run]
            optional_stages = ["fts_indexer"]
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.bucket, "exports");
        assert_eq!(config.discovery.root_prefix, "daily");
        assert_eq!(config.embedding.provider, EmbeddingProvider::Http);
        assert_eq!(config.embedding.dimension, 768);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.run.optional_stages, vec!["fts_indexer"]);
        assert_eq!(config.database.max_connections, 10);
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lakeload.toml");
        std::fs::write(&path, "[run]\nconcurrency = \"many\"\n").unwrap();

        let err = PipelineConfig::from_file(&path).unwrap_err().to_string();
        assert!(err.contains("lakeload.toml"));
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate(false).is_ok());

        let mut no_url = valid();
        no_url.database.url.clear();
        assert!(no_url.validate(false).is_err());
        assert!(no_url.validate(true).is_ok());

        let mut pool = valid();
        pool.database.min_connections = 20;
        assert!(pool.validate(false).unwrap_err().to_string().contains("min_connections"));

        let mut pattern = valid();
        pattern.discovery.date_folder_pattern = "([".to_string();
        assert!(pattern.validate(false).is_err());

        let mut attempts = valid();
        attempts.retry.max_attempts = 0;
        assert!(attempts.validate(false).is_err());

        let mut language = valid();
        language.fts.language = "english'; --".to_string();
        assert!(language.validate(false).is_err());

        let mut bucket = valid();
        bucket.storage.bucket.clear();
        assert!(bucket.validate(true).is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("LAKELOAD_CONCURRENCY", "4");
        std::env::set_var("LAKELOAD_OPTIONAL_STAGES", "fts_indexer, embedding_generator");
        std::env::set_var("LAKELOAD_FTS_LANGUAGE", "simple");

        let config = valid().merge_env().unwrap();

        std::env::remove_var("LAKELOAD_CONCURRENCY");
        std::env::remove_var("LAKELOAD_OPTIONAL_STAGES");
        std::env::remove_var("LAKELOAD_FTS_LANGUAGE");

        assert_eq!(config.run.concurrency, 4);
        assert_eq!(
            config.run.optional_stages,
            vec!["fts_indexer", "embedding_generator"]
        );
        assert_eq!(config.fts.language, "simple");
    }

    #[test]
    #[serial]
    fn test_env_rejects_bad_number() {
        std::env::set_var("LAKELOAD_RETRY_MAX_ATTEMPTS", "lots");
        let result = valid().merge_env();
        std::env::remove_var("LAKELOAD_RETRY_MAX_ATTEMPTS");

        assert!(result.is_err());
    }
}
