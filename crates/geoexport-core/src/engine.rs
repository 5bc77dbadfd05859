//! `TaskedStepEngine` -- the control loop: sizes the fan-out, creates task
//! rows, starts the initial batch, and reacts to async completions by
//! starting replacements, until every row is finalized.
//!
//! The engine is single-threaded-cooperative: callers must serialize calls
//! to `execute` and `on_async_update` for a given instance (the spec places
//! this obligation on the hosting dispatcher, not the engine itself). There
//! is no internal polling loop -- dispatch happens once per `execute` call
//! and once per completion event, matching the source's callback-driven
//! design rather than the agent-orchestrator's polling loop it is grounded
//! on.

use std::sync::Arc;

use async_trait::async_trait;
use geoexport_db::models::TaskProgress;
use geoexport_db::task_table;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::executor::{AsyncSqlExecutor, ResourceShare};
use crate::resource::{ExportKind, ResourceClaim, ResourceEstimator};
use crate::state::StepState;
use crate::stats::{DatasetStatistics, StatisticsClient};

/// Capability set a concrete step kind must implement. The engine loop
/// operates only against this interface; the source's class hierarchy
/// (generic step -> space-based step -> tasked step -> changed-tiles step)
/// becomes this explicit, composable capability set instead.
#[async_trait]
pub trait TaskedStep: Send + Sync {
    /// Build the opaque per-task query for `task_data`, to hand to the
    /// `AsyncSqlExecutor`. Fatal ([`EngineError::TaskQueryBuildError`]) if
    /// `task_data` is malformed.
    fn build_per_task_query(&self, task_data: &serde_json::Value) -> Result<String, EngineError>;

    /// The thread count to use for the initial fan-out, computed once
    /// before `execute`.
    fn initial_thread_count(&self) -> usize;

    /// The export kind this step represents, for the resource estimator's
    /// thread-count policy.
    fn export_kind(&self) -> ExportKind;

    /// Compute and return the task-item payloads to materialize as rows.
    /// Called only on a fresh `execute(resume = false)`.
    async fn create_task_items(&self) -> Result<Vec<serde_json::Value>, EngineError>;
}

// Compile-time assertion: TaskedStep must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskedStep) {}
};

/// The completion event delivered from the database to the engine
/// (`SpaceBasedTaskUpdate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub task_id: i32,
    pub byte_count: i64,
    pub feature_count: i64,
    pub file_count: i32,
}

/// The control loop driving one step to completion.
pub struct TaskedStepEngine<S: TaskedStep> {
    step: S,
    pool: PgPool,
    schema: String,
    step_id: String,
    executor: Arc<dyn AsyncSqlExecutor>,
    statistics: Arc<dyn StatisticsClient>,
    space_id: String,
    state: StepState,
    resource_estimator: ResourceEstimator,
    calculated_thread_count: Option<usize>,
}

impl<S: TaskedStep> TaskedStepEngine<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        step: S,
        pool: PgPool,
        schema: impl Into<String>,
        step_id: impl Into<String>,
        space_id: impl Into<String>,
        executor: Arc<dyn AsyncSqlExecutor>,
        statistics: Arc<dyn StatisticsClient>,
    ) -> Self {
        Self {
            step,
            pool,
            schema: schema.into(),
            step_id: step_id.into(),
            executor,
            statistics,
            space_id: space_id.into(),
            state: StepState::New,
            resource_estimator: ResourceEstimator::new(),
            calculated_thread_count: None,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Force the step to `FAILED`. Callable from any non-terminal state;
    /// callers invoke this after an unrecoverable error (anything other
    /// than the retryable [`EngineError::ResourceClaimRejected`]).
    pub fn mark_failed(&mut self) {
        if !self.state.is_terminal() {
            self.state = StepState::Failed;
        }
    }

    fn transition(&mut self, to: StepState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(to) {
            return Err(EngineError::ValidationError(format!(
                "illegal transition {} -> {}",
                self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Resolve `version_ref` and move the step to `PREPARED`.
    pub async fn prepare(
        &mut self,
        version_ref: &geoexport_db::models::VersionRef,
    ) -> Result<geoexport_db::models::VersionRef, EngineError> {
        let resolved = crate::version::resolve(version_ref, &self.space_id, self.statistics.as_ref())
            .await?;
        self.transition(StepState::Prepared)?;
        Ok(resolved)
    }

    /// Resource claims for this run, computing and caching the ACU budget
    /// on first call.
    pub async fn needed_resources(&mut self) -> Result<Vec<ResourceClaim>, EngineError> {
        let stats = self.dataset_statistics().await?;
        Ok(self.resource_estimator.resource_claims(stats))
    }

    async fn dataset_statistics(&self) -> Result<DatasetStatistics, EngineError> {
        self.statistics
            .dataset_statistics(&self.space_id)
            .await
            .map_err(|e| EngineError::ValidationError(format!("statistics lookup failed: {e}")))
    }

    /// Create the task table and rows (unless resuming), then dispatch the
    /// initial batch, up to `calculated_thread_count` tasks.
    pub async fn execute(&mut self, resume: bool) -> Result<(), EngineError> {
        // Warm the ACU budget from the real dataset size before any task is
        // dispatched, so `pick_and_dispatch`'s per-task share reflects
        // `byteSize` rather than whatever happened to be cached (or not)
        // from an earlier `needed_resources()` call.
        let stats = self.dataset_statistics().await?;
        self.resource_estimator.overall_needed_acus(stats.byte_size);

        if !resume {
            self.transition(StepState::Running)?;

            let thread_count = self.step.initial_thread_count();
            self.calculated_thread_count = Some(thread_count);

            task_table::create(&self.pool, &self.schema, &self.step_id)
                .await
                .map_err(EngineError::TransientDbError)?;

            for item in self.step.create_task_items().await? {
                task_table::insert(&self.pool, &self.schema, &self.step_id, item)
                    .await
                    .map_err(EngineError::TransientDbError)?;
            }

            info!(step_id = %self.step_id, thread_count, "step created, starting initial dispatch");
        } else {
            self.transition(StepState::Running)?;
            info!(step_id = %self.step_id, "resuming step, re-issuing dispatch");
        }

        let thread_count = self
            .calculated_thread_count
            .unwrap_or_else(|| self.step.initial_thread_count());

        let mut last_progress = None;
        for _ in 0..thread_count {
            let progress = self.pick_and_dispatch().await?;
            let dispatched = progress.next_task_id.is_some();
            last_progress = Some(progress);
            if !dispatched {
                break;
            }
        }

        // An empty task set (S1) has nothing to dispatch and no completion
        // event will ever arrive to drive `on_async_update`, so `execute`
        // itself must recognize completion here.
        if let Some(progress) = last_progress {
            if progress.is_complete() {
                self.transition(StepState::Completed)?;
                info!(step_id = %self.step_id, "step completed");
            }
        }

        Ok(())
    }

    /// Pick the next unstarted row, if any, and submit it to the executor.
    /// Returns the counters observed at pick time regardless of whether a
    /// row was available.
    async fn pick_and_dispatch(&mut self) -> Result<TaskProgress, EngineError> {
        let progress = task_table::pick_next_and_report(&self.pool, &self.schema, &self.step_id)
            .await
            .map_err(EngineError::TransientDbError)?;

        if let (Some(task_id), Some(task_data)) =
            (progress.next_task_id, progress.next_task_data.clone())
        {
            let query = self.step.build_per_task_query(&task_data)?;
            // `execute` seeds the budget from the real `byteSize` before the
            // first dispatch, so this argument is never actually consulted;
            // it only matters on the (unreachable in practice) path where
            // `pick_and_dispatch` runs before the cache is warmed.
            let acus = self.resource_estimator.overall_needed_acus(0);
            let share = ResourceShare {
                virtual_units: acus / progress.total.max(1) as f64,
            };
            self.executor
                .submit(task_id, &query, share)
                .await
                .map_err(EngineError::TransientDbError)?;
            info!(step_id = %self.step_id, task_id, "dispatched task");
        }

        Ok(progress)
    }

    /// Record a completion event and, if work remains, dispatch its
    /// replacement. Returns `true` iff the step is now complete.
    pub async fn on_async_update(&mut self, event: ProgressEvent) -> Result<bool, EngineError> {
        let already_finalized =
            task_table::is_finalized(&self.pool, &self.schema, &self.step_id, event.task_id)
                .await
                .map_err(EngineError::TransientDbError)?;

        match already_finalized {
            None => {
                warn!(
                    step_id = %self.step_id,
                    task_id = event.task_id,
                    "async delivery anomaly: progress event for unknown task, dropped"
                );
                return Ok(false);
            }
            Some(true) => {
                warn!(
                    step_id = %self.step_id,
                    task_id = event.task_id,
                    "async delivery anomaly: progress event for already-finalized task, dropped"
                );
                return Ok(false);
            }
            Some(false) => {}
        }

        task_table::record_progress(
            &self.pool,
            &self.schema,
            &self.step_id,
            event.task_id,
            event.byte_count,
            event.feature_count,
            event.file_count,
            true,
        )
        .await
        .map_err(EngineError::TransientDbError)?;

        let progress = self.pick_and_dispatch().await?;

        if progress.is_complete() {
            self.transition(StepState::Completed)?;
            info!(step_id = %self.step_id, "step completed");
            return Ok(true);
        }

        info!(
            step_id = %self.step_id,
            progress = progress.progress_fraction(),
            "step progress updated"
        );
        Ok(false)
    }
}
