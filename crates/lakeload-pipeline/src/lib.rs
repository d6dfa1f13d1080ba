//! Lakeload Pipeline Library
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//!
//! Loads dated batches of parquet column files from an S3-compatible bucket
//! into Postgres, then adds embeddings and full-text search to the loaded
//! tables.
//!
//! # Overview
//!
//! - **Discovery**: [`discovery::StorageDiscovery`] finds the latest (or a
//!   pinned) `<root>/<YYYY-MM-DD-HH>/<entity>/*.parquet` batch
//! - **Gateway**: [`db::Gateway`] runs statements on a bounded pool with retry,
//!   transactions and batched upserts
//! - **Components**: [`components::Importer`], [`components::EmbeddingGenerator`]
//!   and [`components::FtsIndexer`] implement [`components::PipelineComponent`]
//! - **Orchestrator**: [`orchestrator::Orchestrator`] runs every entity through
//!   the chain and assembles the [`report::RunResult`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lakeload_pipeline::components::default_chain;
//! use lakeload_pipeline::config::PipelineConfig;
//! use lakeload_pipeline::db::{create_pool, Gateway};
//! use lakeload_pipeline::discovery::StorageDiscovery;
//! use lakeload_pipeline::embedding::build_embedder;
//! use lakeload_pipeline::orchestrator::{Orchestrator, RunOptions};
//! use lakeload_pipeline::storage::S3ObjectStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = PipelineConfig::load(None)?;
//! config.validate(false)?;
//!
//! let store = Arc::new(S3ObjectStore::new(&config.storage).await);
//! let discovery = Arc::new(StorageDiscovery::new(
//!     store,
//!     config.discovery.clone(),
//!     config.retry.clone(),
//! )?);
//! let pool = create_pool(&config.database).await?;
//! let gateway = Arc::new(Gateway::new(pool, config.retry.clone(), config.database.bulk_batch_rows));
//! let embedder = build_embedder(&config.embedding, &config.retry)?;
//!
//! let chain = default_chain(&config, discovery.clone(), gateway, embedder);
//! let result = Orchestrator::new(discovery, chain)
//!     .run(&RunOptions::default(), CancellationToken::new())
//!     .await;
//! println!("{}", result.summary());
//! # Ok(())
//! # }
//! ```

pub mod columnar;
pub mod components;
pub mod config;
pub mod context;
pub mod db;
pub mod discovery;
pub mod embedding;
pub mod error;
pub mod orchestrator;
pub mod preflight;
pub mod report;
pub mod retry;
pub mod storage;

pub use config::PipelineConfig;
pub use context::RunContext;
pub use error::{FailureKind, PipelineError};
pub use orchestrator::{ChainLink, Orchestrator, RunOptions};
pub use report::{RunResult, RunStatus, StageResult, StageStatus};
