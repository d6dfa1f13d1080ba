//! Lakeload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared ambient concerns for the lakeload workspace.
//!
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Error Handling**: [`LakeloadError`] and the [`Result`] alias
//! - **Checksums**: SHA-256 helpers used for row identity and change detection
//!
//! # Example
//!
//! ```no_run
//! use lakeload_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{LakeloadError, Result};
