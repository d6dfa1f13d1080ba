use async_trait::async_trait;
use aws_sdk_s3::{
    config::{http::HttpResponse, Credentials, Region},
    error::{DisplayErrorContext, SdkError},
    Client,
};
use bytes::Bytes;
use tracing::{debug, info, instrument};

use super::{is_transient_status, ObjectEntry, ObjectListing, ObjectStore, StorageConfig};
use crate::error::StoreError;

/// S3 (or MinIO) backed object store
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: &StorageConfig) -> Self {
        debug!(
            "Initializing storage for bucket {} (endpoint: {:?}, path style: {})",
            config.bucket, config.endpoint, config.path_style
        );

        let region = Region::new(config.region.clone());
        let mut s3_config_builder = if config.has_static_credentials() {
            let credentials = Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "lakeload-storage",
            );
            aws_sdk_s3::Config::builder()
                .credentials_provider(credentials)
                .region(region)
        } else {
            let shared = aws_config::from_env().region(region).load().await;
            aws_sdk_s3::config::Builder::from(&shared)
        };

        s3_config_builder = s3_config_builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Map an SDK failure onto the retry classification
fn classify<E>(err: SdkError<E, HttpResponse>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        },
        SdkError::ServiceError(_) => err
            .raw_response()
            .map(|raw| is_transient_status(raw.status().as_u16()))
            .unwrap_or(false),
        _ => false,
    };
    let message = DisplayErrorContext(&err).to_string();
    StoreError { transient, message }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn location(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<ObjectListing, StoreError> {
        debug!("Listing objects in s3://{}/{}", self.bucket, prefix);

        let mut listing = ObjectListing::default();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(delimiter) = delimiter {
                request = request.delimiter(delimiter);
            }
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(classify)?;

            listing.prefixes.extend(
                response
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(|s| s.to_string())),
            );
            listing
                .objects
                .extend(response.contents().iter().filter_map(|obj| {
                    obj.key().map(|key| ObjectEntry {
                        key: key.to_string(),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        etag: obj.e_tag().map(|e| e.trim_matches('"').to_string()),
                    })
                }));

            match (response.is_truncated(), response.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(
            "Listed {} prefixes and {} objects under s3://{}/{}",
            listing.prefixes.len(),
            listing.objects.len(),
            self.bucket,
            prefix
        );

        Ok(listing)
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        debug!("Downloading from s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::transient(format!("Failed to read S3 response body: {}", e)))?
            .into_bytes();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_location_uses_bucket() {
        let store = S3ObjectStore::new(&StorageConfig::for_minio(
            "http://localhost:9000",
            "lake-exports",
        ))
        .await;

        assert_eq!(store.bucket(), "lake-exports");
        assert_eq!(store.location(), "s3://lake-exports");
    }
}
