use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::components::PipelineComponent;

/// Per-run invocation options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunOptions {
    /// Pin a date folder instead of taking the latest
    pub date_folder: Option<String>,
    /// Restrict the run to one entity (table name or source folder)
    pub entity_filter: Option<String>,
    pub skip_embeddings: bool,
    pub dry_run: bool,
    /// Where the CLI writes the JSON report
    pub output_path: Option<PathBuf>,
    /// Verbosity only
    pub debug: bool,
    /// Recompute embeddings and search vectors even when current
    pub force: bool,
    /// Entities processed at once
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            date_folder: None,
            entity_filter: None,
            skip_embeddings: false,
            dry_run: false,
            output_path: None,
            debug: false,
            force: false,
            concurrency: 1,
        }
    }
}

/// A component in the chain and whether its failure stops the entity
#[derive(Clone)]
pub struct ChainLink {
    pub component: Arc<dyn PipelineComponent>,
    pub required: bool,
}

impl ChainLink {
    pub fn new(component: Arc<dyn PipelineComponent>, required: bool) -> Self {
        Self { component, required }
    }

    pub fn required(component: Arc<dyn PipelineComponent>) -> Self {
        Self::new(component, true)
    }

    pub fn optional(component: Arc<dyn PipelineComponent>) -> Self {
        Self::new(component, false)
    }

    pub fn name(&self) -> &str {
        self.component.name()
    }
}

impl fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainLink")
            .field("component", &self.name())
            .field("required", &self.required)
            .finish()
    }
}
