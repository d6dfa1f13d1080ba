//! Text embedding capability
//!
//! The pipeline only needs `embed(texts) -> vectors` with a fixed dimension.
//! Two providers ship: an OpenAI-compatible HTTP endpoint and a deterministic
//! hash-based embedder for local runs and tests. HTTP requests are retried
//! on 5xx, 429, timeouts and connection failures.

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConfigError, EmbeddingError};
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
/// Model label reported by [`HashEmbedder`], whatever `embedding.model` says
pub const HASH_MODEL: &str = "hash";
pub const DEFAULT_DIMENSION: usize = 384;
pub const DEFAULT_BATCH_SIZE: usize = 32;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    fn dimension(&self) -> usize;

    /// One vector per input, in input order
    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Hash,
    Http,
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "http" | "openai" => Ok(Self::Http),
            other => Err(ConfigError::invalid(format!("unknown embedding provider '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimension: usize,
    /// Endpoint for the HTTP provider, e.g. `http://localhost:8080/v1/embeddings`
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Texts per provider call
    pub batch_size: usize,
    pub timeout_secs: u64,
    /// Explicit columns to embed; otherwise picked from the imported schema
    pub text_columns: Option<Vec<String>>,
    /// Cap when falling back to "first N text columns"
    pub max_text_columns: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hash,
            model: DEFAULT_MODEL.to_string(),
            dimension: DEFAULT_DIMENSION,
            endpoint: None,
            api_key: None,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_secs: 30,
            text_columns: None,
            max_text_columns: 3,
        }
    }
}

/// Construct the configured provider
pub fn build_embedder(
    config: &EmbeddingConfig,
    retry: &RetryPolicy,
) -> Result<Arc<dyn Embedder>, ConfigError> {
    if config.dimension == 0 {
        return Err(ConfigError::invalid("embedding dimension must be greater than zero"));
    }

    match config.provider {
        EmbeddingProvider::Hash => Ok(Arc::new(HashEmbedder::new(config.dimension))),
        EmbeddingProvider::Http => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                ConfigError::invalid("embedding.endpoint is required for the http provider")
            })?;
            let embedder = HttpEmbedder::new(
                endpoint,
                config.model.clone(),
                config.dimension,
                config.api_key.clone(),
                Duration::from_secs(config.timeout_secs),
            )
            .map_err(|e| ConfigError::invalid(e.to_string()))?
            .with_retry(retry.clone());
            Ok(Arc::new(embedder))
        },
    }
}

/// Deterministic unit vectors seeded from the SHA-256 of the text
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let seed: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        let mut rng = StdRng::from_seed(seed);

        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|_| rng.gen_range(-1.0f32..1.0f32))
            .collect();

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model(&self) -> &str {
        HASH_MODEL
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(
        &self,
        texts: &[String],
        _cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` endpoint
#[derive(Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EmbeddingError::from)?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            dimension,
            api_key,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// One POST, no retry
    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::from_status(status, &body));
        }

        let mut payload: EmbeddingResponse = response.json().await?;
        if payload.data.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: payload.data.len(),
            });
        }

        payload.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));

        payload
            .data
            .into_iter()
            .map(|d| {
                if d.embedding.len() != self.dimension {
                    Err(EmbeddingError::DimensionMismatch {
                        expected: self.dimension,
                        got: d.embedding.len(),
                    })
                } else {
                    Ok(d.embedding)
                }
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Requesting {} embeddings from {}", texts.len(), self.endpoint);

        self.retry
            .run("embed", cancel, |_| self.request(texts))
            .await
            .map_err(EmbeddingError::from_retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(10)).without_jitter()
    }

    fn http(uri: String) -> HttpEmbedder {
        HttpEmbedder::new(uri, "m", 2, None, Duration::from_secs(5))
            .unwrap()
            .with_retry(quick_retry())
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_unit_length() {
        let embedder = HashEmbedder::new(16);
        let texts = vec!["Blue widget".to_string(), "Red widget".to_string()];
        let cancel = CancellationToken::new();

        let first = embedder.embed(&texts, &cancel).await.unwrap();
        let second = embedder.embed(&texts, &cancel).await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first[0], first[1]);
        assert_eq!(first[0].len(), 16);
        let norm: f32 = first[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("HTTP".parse::<EmbeddingProvider>().unwrap(), EmbeddingProvider::Http);
        assert!("bert".parse::<EmbeddingProvider>().is_err());
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let config = EmbeddingConfig {
            provider: EmbeddingProvider::Http,
            ..EmbeddingConfig::default()
        };
        assert!(build_embedder(&config, &quick_retry()).is_err());
    }

    #[test]
    fn test_hash_provider_reports_hash_model() {
        let config = EmbeddingConfig::default();
        let embedder = build_embedder(&config, &quick_retry()).unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(embedder.model(), HASH_MODEL);
    }

    #[tokio::test]
    async fn test_http_embedder_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(
            format!("{}/v1/embeddings", server.uri()),
            "test-model",
            2,
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        let vectors = embedder
            .embed(&["a".to_string(), "b".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_http_embedder_rejects_wrong_dimension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0, 0.0]}]
            })))
            .mount(&server)
            .await;

        let err = http(server.uri())
            .embed(&["a".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch { expected: 2, got: 3 }
        ));
    }

    #[tokio::test]
    async fn test_http_embedder_retries_unavailable_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [0.6, 0.8]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let vectors = http(server.uri())
            .embed(&["a".to_string()], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(vectors, vec![vec![0.6, 0.8]]);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_http_embedder_surfaces_exhausted_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
            .mount(&server)
            .await;

        let err = http(server.uri())
            .embed(&["a".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EmbeddingError::Retry { kind: crate::error::FailureKind::TransientExhausted, attempts: 2, .. }
        ));
        assert!(err.to_string().contains("model overloaded"));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_http_embedder_does_not_retry_bad_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("input too long"))
            .mount(&server)
            .await;

        let err = http(server.uri())
            .embed(&["a".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EmbeddingError::Request(_)));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
