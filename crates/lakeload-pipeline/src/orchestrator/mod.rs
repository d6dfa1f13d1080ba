//! Run orchestration
//!
//! A run moves through `Init → Discovering → Processing → Finalized`. Each
//! entity goes through the component chain in order; entities are
//! independent, so a failed entity never stops the others. Only a run-fatal
//! error (pool exhaustion after retries) or cancellation ends processing
//! early.
//!
//! Entities may run concurrently (`RunOptions::concurrency`), but results are
//! appended in discovery order by this task alone, and each entity's results
//! keep chain order.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::components::{embeddings, EntityData, StageOutcome};
use crate::context::RunContext;
use crate::discovery::{Batch, EntityRef, StorageDiscovery};
use crate::report::{
    EntityStatus, EntitySummary, RunResult, RunStats, RunStatus, StageResult, StageStatus,
};

mod options;

pub use options::{ChainLink, RunOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Discovering,
    Processing,
    Finalized,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Init => "init",
            RunPhase::Discovering => "discovering",
            RunPhase::Processing => "processing",
            RunPhase::Finalized => "finalized",
        })
    }
}

/// What happened to one entity
#[derive(Debug)]
struct EntityRun {
    name: String,
    started: bool,
    results: Vec<StageResult>,
    /// A required stage was skipped because the run stopped
    interrupted: bool,
    fatal: Option<String>,
}

impl EntityRun {
    fn not_started(name: &str) -> Self {
        Self {
            name: name.to_string(),
            started: false,
            results: Vec::new(),
            interrupted: false,
            fatal: None,
        }
    }

    fn summary(&self) -> EntitySummary {
        let first_failure = self
            .results
            .iter()
            .find(|r| r.required && r.status == StageStatus::Failure)
            .map(|r| format!("{}: {}", r.component_name, r.message));

        let status = if !self.started {
            EntityStatus::NotStarted
        } else if first_failure.is_some() || self.interrupted {
            EntityStatus::Failed
        } else {
            EntityStatus::Succeeded
        };

        let first_failure = first_failure.or_else(|| {
            self.interrupted
                .then(|| "interrupted before all required stages ran".to_string())
        });

        EntitySummary {
            name: self.name.clone(),
            status,
            first_failure,
        }
    }
}

/// Runs a discovered batch through an ordered component chain
pub struct Orchestrator {
    discovery: Arc<StorageDiscovery>,
    chain: Vec<ChainLink>,
}

impl Orchestrator {
    pub fn new(discovery: Arc<StorageDiscovery>, chain: Vec<ChainLink>) -> Self {
        Self { discovery, chain }
    }

    pub fn chain(&self) -> &[ChainLink] {
        &self.chain
    }

    /// The chain for one run, without the embedding stage when skipped
    pub fn effective_chain(&self, options: &RunOptions) -> Vec<ChainLink> {
        self.chain
            .iter()
            .filter(|link| !(options.skip_embeddings && link.name() == embeddings::COMPONENT_NAME))
            .cloned()
            .collect()
    }

    #[instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, options: &RunOptions, cancel: CancellationToken) -> RunResult {
        let ctx = RunContext::new(cancel)
            .with_dry_run(options.dry_run)
            .with_force(options.force);
        tracing::Span::current().record("run_id", tracing::field::display(ctx.run_id));

        let mut result = RunResult::new(ctx.run_id, options.dry_run);
        let mut phase = RunPhase::Init;
        info!(phase = %phase, dry_run = options.dry_run, "Starting pipeline run {}", ctx.run_id);

        let chain = self.effective_chain(options);
        if chain.is_empty() {
            result.message = "component chain is empty; nothing to run".to_string();
            return finalize(result, &ctx, Vec::new());
        }
        info!(
            "Chain: {}",
            chain
                .iter()
                .map(|l| format!("{}{}", l.name(), if l.required { "" } else { " (optional)" }))
                .collect::<Vec<_>>()
                .join(" → ")
        );

        phase = RunPhase::Discovering;
        info!(phase = %phase, "Discovering batch");
        let discovered = match &options.date_folder {
            Some(folder) => self.discovery.find_batch(folder, &ctx.cancel).await,
            None => self.discovery.find_latest_batch(&ctx.cancel).await,
        };
        let batch = match discovered {
            Ok(batch) => batch,
            Err(err) => {
                error!("Discovery failed: {}", err);
                result.message = format!("discovery failed: {}", err);
                result.fatal_error = Some(err.to_string());
                return finalize(result, &ctx, Vec::new());
            },
        };

        result.available_entities = batch.entity_names();
        let entities = match select_entities(&batch, options.entity_filter.as_deref()) {
            Ok(entities) => entities,
            Err(message) => {
                warn!("{}", message);
                result.message = message;
                result.batch = Some(batch);
                return finalize(result, &ctx, Vec::new());
            },
        };
        result.batch = Some(batch);

        phase = RunPhase::Processing;
        info!(
            phase = %phase,
            "Processing {} entit{} (concurrency {})",
            entities.len(),
            if entities.len() == 1 { "y" } else { "ies" },
            options.concurrency.max(1)
        );

        // Cancelled by the user or by a run-fatal error in any entity
        let halt = ctx.cancel.child_token();
        let entity_ctx = RunContext {
            cancel: halt.clone(),
            ..ctx.clone()
        };

        let mut runs = Vec::with_capacity(entities.len());
        let mut stream = stream::iter(entities)
            .map(|entity| self.run_entity(&entity_ctx, &ctx.cancel, &halt, &chain, entity))
            .buffered(options.concurrency.max(1));

        while let Some(run) = stream.next().await {
            if let Some(fatal) = &run.fatal {
                if result.fatal_error.is_none() {
                    result.fatal_error = Some(fatal.clone());
                }
            }
            result.stage_results.extend(run.results.iter().cloned());
            runs.push(run);
        }

        finalize(result, &ctx, runs)
    }

    async fn run_entity(
        &self,
        ctx: &RunContext,
        user_cancel: &CancellationToken,
        halt: &CancellationToken,
        chain: &[ChainLink],
        entity: EntityRef,
    ) -> EntityRun {
        if ctx.is_cancelled() {
            return EntityRun::not_started(&entity.name);
        }

        info!("Processing entity {} ({} files)", entity.name, entity.source_file_refs.len());

        let mut run = EntityRun {
            name: entity.name.clone(),
            started: true,
            results: Vec::with_capacity(chain.len()),
            interrupted: false,
            fatal: None,
        };
        let mut data = EntityData::default();
        let mut blocked_by: Option<String> = None;

        for link in chain {
            let component = link.name().to_string();

            let skip_reason = if ctx.is_cancelled() {
                if link.required {
                    run.interrupted = true;
                }
                Some(if user_cancel.is_cancelled() {
                    "skipped: run cancelled".to_string()
                } else {
                    "skipped: run halted after fatal error".to_string()
                })
            } else {
                blocked_by
                    .as_ref()
                    .filter(|_| link.required)
                    .map(|stage| format!("skipped: earlier required stage '{}' failed", stage))
            };

            if let Some(reason) = skip_reason {
                info!("- {} / {}: {}", entity.name, component, reason);
                run.results.push(stage_result(&entity, link, StageOutcome::skipped(reason), 0));
                continue;
            }

            let started = Instant::now();
            let outcome = match link.component.process_entity(ctx, &entity, &mut data).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    if err.is_run_fatal() {
                        error!("{} / {}: run-fatal error: {}", entity.name, component, err);
                        run.fatal = Some(format!("{} / {}: {}", entity.name, component, err));
                        halt.cancel();
                    }
                    StageOutcome::failure(format!("unexpected error: {}", err), None)
                },
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome.status {
                StageStatus::Success => info!(
                    "✓ {} / {}: {} ({}ms)",
                    entity.name, component, outcome.message, duration_ms
                ),
                StageStatus::Failure => error!(
                    "✗ {} / {}: {} ({}ms)",
                    entity.name, component, outcome.message, duration_ms
                ),
                StageStatus::Skipped => info!("- {} / {}: {}", entity.name, component, outcome.message),
            }

            if outcome.status == StageStatus::Failure && link.required && blocked_by.is_none() {
                blocked_by = Some(component);
            }
            run.results.push(stage_result(&entity, link, outcome, duration_ms));
        }

        run
    }
}

fn stage_result(entity: &EntityRef, link: &ChainLink, outcome: StageOutcome, duration_ms: u64) -> StageResult {
    StageResult {
        entity_name: entity.name.clone(),
        component_name: link.name().to_string(),
        status: outcome.status,
        message: outcome.message,
        rows_affected: outcome.rows_affected,
        duration_ms,
        required: link.required,
    }
}

/// Entities to process, honouring the filter
///
/// The filter matches the table name or the source folder name. A batch with
/// no entities, or a filter that matches nothing, is an error message.
fn select_entities(batch: &Batch, filter: Option<&str>) -> Result<Vec<EntityRef>, String> {
    if batch.entities.is_empty() {
        return Err(format!(
            "batch '{}' contains no entity folders",
            batch.date_folder_id
        ));
    }

    let Some(filter) = filter else {
        return Ok(batch.entities.clone());
    };

    let selected: Vec<EntityRef> = batch
        .entities
        .iter()
        .filter(|e| e.name == filter || e.folder == filter)
        .cloned()
        .collect();

    if selected.is_empty() {
        return Err(format!(
            "entity '{}' not found in batch '{}' (available: {})",
            filter,
            batch.date_folder_id,
            batch.entity_names().join(", ")
        ));
    }
    Ok(selected)
}

fn finalize(mut result: RunResult, ctx: &RunContext, runs: Vec<EntityRun>) -> RunResult {
    result.cancelled = ctx.is_cancelled();
    let entities: Vec<EntitySummary> = runs.iter().map(EntityRun::summary).collect();

    let count = |status: EntityStatus| entities.iter().filter(|e| e.status == status).count();
    result.stats = RunStats {
        total_entities: entities.len(),
        successful_entities: count(EntityStatus::Succeeded),
        failed_entities: count(EntityStatus::Failed),
        not_started_entities: count(EntityStatus::NotStarted),
    };
    result.entities = entities;

    let processed = result.stats.total_entities > 0;
    let all_succeeded = result.stats.successful_entities == result.stats.total_entities;

    result.overall_status = if processed
        && all_succeeded
        && result.fatal_error.is_none()
        && !result.cancelled
    {
        RunStatus::Success
    } else {
        RunStatus::Failure
    };

    if result.message.is_empty() {
        result.message = if result.cancelled {
            format!(
                "run cancelled: {} of {} entities completed",
                result.stats.successful_entities, result.stats.total_entities
            )
        } else if result.fatal_error.is_some() {
            format!(
                "run halted after fatal error: {} succeeded, {} failed, {} not started",
                result.stats.successful_entities,
                result.stats.failed_entities,
                result.stats.not_started_entities
            )
        } else if all_succeeded {
            format!("all {} entities succeeded", result.stats.total_entities)
        } else {
            format!(
                "{} of {} entities failed",
                result.stats.failed_entities, result.stats.total_entities
            )
        };
    }

    result.finished_at = Some(Utc::now());
    info!(
        phase = %RunPhase::Finalized,
        status = result.overall_status.as_str(),
        "{} ({:.2}s)",
        result.message,
        result.duration_secs()
    );
    result
}
