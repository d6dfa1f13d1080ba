//! Stage and run outcome records
//!
//! [`RunResult`] is the only artifact a run reports: it serializes to the
//! JSON written by `--output` and renders the console summary.

use chrono::{DateTime, Utc};
use lakeload_common::LakeloadError;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

use crate::discovery::Batch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Failure,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::Failure => "failure",
            StageStatus::Skipped => "skipped",
        }
    }

    fn marker(&self) -> &'static str {
        match self {
            StageStatus::Success => "✓",
            StageStatus::Failure => "✗",
            StageStatus::Skipped => "-",
        }
    }
}

/// Outcome of one component acting on one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub entity_name: String,
    pub component_name: String,
    pub status: StageStatus,
    pub message: String,
    pub rows_affected: Option<u64>,
    pub duration_ms: u64,
    /// Whether a failure here counts against the entity
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Succeeded,
    Failed,
    /// Never started because the run was cancelled or halted first
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub name: String,
    pub status: EntityStatus,
    pub first_failure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_entities: usize,
    pub successful_entities: usize,
    pub failed_entities: usize,
    pub not_started_entities: usize,
}

/// Aggregate of a full run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub batch: Option<Batch>,
    /// Every discovered entity, including ones excluded by the filter
    pub available_entities: Vec<String>,
    pub stage_results: Vec<StageResult>,
    pub entities: Vec<EntitySummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub overall_status: RunStatus,
    pub message: String,
    pub fatal_error: Option<String>,
    pub cancelled: bool,
    pub dry_run: bool,
    pub stats: RunStats,
}

impl RunResult {
    pub fn new(run_id: Uuid, dry_run: bool) -> Self {
        Self {
            run_id,
            batch: None,
            available_entities: Vec::new(),
            stage_results: Vec::new(),
            entities: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            overall_status: RunStatus::Failure,
            message: String::new(),
            fatal_error: None,
            cancelled: false,
            dry_run,
            stats: RunStats::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.overall_status == RunStatus::Success
    }

    pub fn duration_secs(&self) -> f64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default()
    }

    pub fn date_folder(&self) -> Option<&str> {
        self.batch.as_ref().map(|b| b.date_folder_id.as_str())
    }

    /// Stage results for one entity, in chain order
    pub fn results_for<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a StageResult> {
        self.stage_results.iter().filter(move |r| r.entity_name == entity)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), LakeloadError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Human-readable report for the console
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(60);

        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "PIPELINE RUN SUMMARY{}", if self.dry_run { " (dry run)" } else { "" });
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "Run ID:      {}", self.run_id);
        let _ = writeln!(out, "Date folder: {}", self.date_folder().unwrap_or("-"));
        let _ = writeln!(out, "Status:      {}", self.overall_status.as_str().to_uppercase());
        let _ = writeln!(out, "Run time:    {:.2}s", self.duration_secs());
        if !self.message.is_empty() {
            let _ = writeln!(out, "Message:     {}", self.message);
        }
        if let Some(fatal) = &self.fatal_error {
            let _ = writeln!(out, "Fatal error: {}", fatal);
        }
        let _ = writeln!(
            out,
            "Entities:    {} total, {} succeeded, {} failed, {} not started",
            self.stats.total_entities,
            self.stats.successful_entities,
            self.stats.failed_entities,
            self.stats.not_started_entities
        );

        for entity in &self.entities {
            let _ = writeln!(out);
            let marker = match entity.status {
                EntityStatus::Succeeded => "✓",
                EntityStatus::Failed => "✗",
                EntityStatus::NotStarted => "-",
            };
            let _ = writeln!(out, "{} {}", marker, entity.name);
            for stage in self.results_for(&entity.name) {
                let rows = stage
                    .rows_affected
                    .map(|r| format!(" [{} rows]", r))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "    {} {:<20} {}{} ({}ms)",
                    stage.status.marker(),
                    stage.component_name,
                    stage.message,
                    rows,
                    stage.duration_ms
                );
            }
            if let Some(failure) = &entity.first_failure {
                let _ = writeln!(out, "    first failure: {}", failure);
            }
        }
        let _ = writeln!(out, "{}", rule);

        out
    }
}
