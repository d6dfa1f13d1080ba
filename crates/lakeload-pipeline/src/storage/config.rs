use serde::{Deserialize, Serialize};
use std::env;

/// Connection settings for the S3-compatible bucket holding the batches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub path_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            path_style: false,
        }
    }
}

impl StorageConfig {
    /// Defaults overlaid with `S3_*` / `AWS_*` variables
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Overlay whatever `S3_*` / `AWS_*` variables are set
    pub fn merge_env(mut self) -> Self {
        if let Ok(endpoint) = env::var("S3_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Ok(region) = env::var("S3_REGION").or_else(|_| env::var("AWS_REGION")) {
            self.region = region;
        }
        if let Ok(bucket) = env::var("S3_BUCKET") {
            self.bucket = bucket;
        }
        if let Ok(key) = env::var("S3_ACCESS_KEY").or_else(|_| env::var("AWS_ACCESS_KEY_ID")) {
            self.access_key = key;
        }
        if let Ok(secret) =
            env::var("S3_SECRET_KEY").or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
        {
            self.secret_key = secret;
        }
        if let Some(path_style) = env::var("S3_PATH_STYLE").ok().and_then(|v| v.parse().ok()) {
            self.path_style = path_style;
        }
        self
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }

    /// Whether explicit keys were given; otherwise the default AWS chain is used
    pub fn has_static_credentials(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "test-bucket");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert_eq!(config.bucket, "test-bucket");
        assert!(config.path_style);
        assert!(config.has_static_credentials());
    }

    #[test]
    #[serial]
    fn test_merge_env_overrides_only_set_vars() {
        env::set_var("S3_BUCKET", "lake-exports");
        env::set_var("S3_PATH_STYLE", "true");
        env::remove_var("S3_ENDPOINT");

        let base = StorageConfig {
            region: "eu-west-1".to_string(),
            ..StorageConfig::default()
        };
        let config = base.merge_env();

        env::remove_var("S3_BUCKET");
        env::remove_var("S3_PATH_STYLE");

        assert_eq!(config.bucket, "lake-exports");
        assert!(config.path_style);
        assert_eq!(config.endpoint, None);
    }

    #[test]
    fn test_secret_not_serialized() {
        let config = StorageConfig::for_minio("http://localhost:9000", "b");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret_key"));
    }
}
