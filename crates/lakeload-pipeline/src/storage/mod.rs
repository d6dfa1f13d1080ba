//! Object storage access
//!
//! Discovery only needs two primitives from the bucket: a delimiter-aware
//! listing and a whole-object read. [`ObjectStore`] captures exactly that so
//! the S3 client and the in-memory store used by tests are interchangeable.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

pub mod config;
pub mod memory;
pub mod s3;

pub use config::StorageConfig;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// One object returned by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// Result of listing a prefix
///
/// With a delimiter, `prefixes` holds the immediate "sub-folders" (each
/// ending in the delimiter) and `objects` the keys directly under `prefix`.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub prefixes: Vec<String>,
    pub objects: Vec<ObjectEntry>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket`
    fn location(&self) -> String;

    /// List every key under `prefix`, following continuation tokens
    async fn list(&self, prefix: &str, delimiter: Option<&str>)
        -> Result<ObjectListing, StoreError>;

    /// Read a whole object into memory
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;
}

/// HTTP statuses worth retrying: throttling, timeouts and server errors
pub(crate) fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(500));
        assert!(is_transient_status(503));
        assert!(is_transient_status(429));
        assert!(!is_transient_status(404));
        assert!(!is_transient_status(403));
    }
}
