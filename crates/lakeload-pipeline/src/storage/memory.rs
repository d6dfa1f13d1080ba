use async_trait::async_trait;
use bytes::Bytes;
use lakeload_common::checksum::sha256_hex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use super::{ObjectEntry, ObjectListing, ObjectStore};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, Bytes>,
    /// Errors handed out (front first) by the next `get` calls for a key
    injected: HashMap<String, VecDeque<StoreError>>,
    get_calls: HashMap<String, u32>,
    list_calls: u32,
}

/// Object store held entirely in memory
///
/// Mirrors S3 listing semantics (prefix + delimiter) and supports queued
/// failures per key, which the discovery and retry tests rely on.
#[derive(Default)]
pub struct MemoryObjectStore {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryObjectStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning is ignored; a panicking assertion leaves the map intact
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.lock().objects.insert(key.into(), data.into());
    }

    /// Queue `count` copies of `error` for the next reads of `key`
    pub fn fail_next(&self, key: &str, count: usize, error: StoreError) {
        let mut inner = self.lock();
        let queue = inner.injected.entry(key.to_string()).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    pub fn get_calls(&self, key: &str) -> u32 {
        self.lock().get_calls.get(key).copied().unwrap_or(0)
    }

    pub fn list_calls(&self) -> u32 {
        self.lock().list_calls
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn location(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<ObjectListing, StoreError> {
        let mut inner = self.lock();
        inner.list_calls += 1;

        let mut prefixes = BTreeSet::new();
        let mut objects = Vec::new();

        for (key, data) in inner.objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            match delimiter.and_then(|d| rest.find(d).map(|pos| pos + d.len())) {
                Some(end) => {
                    prefixes.insert(format!("{}{}", prefix, &rest[..end]));
                },
                None => objects.push(ObjectEntry {
                    key: key.clone(),
                    size: data.len() as u64,
                    etag: Some(sha256_hex(data)),
                }),
            }
        }

        Ok(ObjectListing {
            prefixes: prefixes.into_iter().collect(),
            objects,
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let mut inner = self.lock();
        *inner.get_calls.entry(key.to_string()).or_insert(0) += 1;

        if let Some(err) = inner.injected.get_mut(key).and_then(|q| q.pop_front()) {
            return Err(err);
        }

        inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::permanent(format!("NoSuchKey: {}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryObjectStore {
        let store = MemoryObjectStore::new("lake");
        store.put("exports/2025-04-14-09/products/part-0.parquet", "a");
        store.put("exports/2025-04-14-09/products/part-1.parquet", "bb");
        store.put("exports/2025-04-14-09/customers/part-0.parquet", "c");
        store.put("exports/2025-04-13-09/products/part-0.parquet", "d");
        store.put("exports/README.md", "e");
        store
    }

    #[tokio::test]
    async fn test_list_with_delimiter_groups_prefixes() {
        let listing = store().list("exports/", Some("/")).await.unwrap();

        assert_eq!(
            listing.prefixes,
            vec!["exports/2025-04-13-09/", "exports/2025-04-14-09/"]
        );
        assert_eq!(listing.objects.len(), 1);
        assert_eq!(listing.objects[0].key, "exports/README.md");
    }

    #[tokio::test]
    async fn test_list_without_delimiter_is_recursive() {
        let listing = store()
            .list("exports/2025-04-14-09/products/", None)
            .await
            .unwrap();

        assert!(listing.prefixes.is_empty());
        assert_eq!(listing.objects.len(), 2);
        assert_eq!(listing.objects[1].size, 2);
    }

    #[tokio::test]
    async fn test_injected_failures_come_first() {
        let store = store();
        let key = "exports/README.md";
        store.fail_next(key, 2, StoreError::transient("503 Slow Down"));

        assert!(store.get(key).await.is_err());
        assert!(store.get(key).await.is_err());
        assert_eq!(store.get(key).await.unwrap(), Bytes::from("e"));
        assert_eq!(store.get_calls(key), 3);
    }

    #[tokio::test]
    async fn test_missing_key_is_permanent() {
        let err = store().get("exports/nope").await.unwrap_err();
        assert!(!err.transient);
    }
}
