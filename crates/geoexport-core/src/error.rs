//! Domain error kinds for the tasked-step execution engine.
//!
//! `AsyncDeliveryAnomaly` is deliberately not a variant here: per its "never
//! fatal" rule it cannot propagate as an `Err`, so it is represented instead
//! as a logged event and a plain return value from
//! [`crate::engine::TaskedStepEngine::on_async_update`].

use thiserror::Error;

/// Errors the engine can surface to its caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Inputs fail preconditions: null/unresolvable `versionRef`, level out
    /// of range, insufficient history, a dataset marked deactivated.
    /// Terminal for the step.
    #[error("validation failed: {0}")]
    ValidationError(String),

    /// The resource manager refused the requested compute-unit claim.
    /// Retryable by the outer scheduler.
    #[error("resource claim rejected: {0}")]
    ResourceClaimRejected(String),

    /// An I/O or statement failure on a non-mutating query, after exceeding
    /// the executor's own retry budget.
    #[error("transient database error: {0}")]
    TransientDbError(#[source] anyhow::Error),

    /// The per-task query could not be constructed. Indicates a bug or a
    /// malformed `task_data`.
    #[error("failed to build query for task {task_id}: {reason}")]
    TaskQueryBuildError { task_id: i32, reason: String },
}

impl EngineError {
    /// A stable, lowercase kind tag for logging/metrics, independent of the
    /// human-readable message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationError(_) => "validation_error",
            Self::ResourceClaimRejected(_) => "resource_claim_rejected",
            Self::TransientDbError(_) => "transient_db_error",
            Self::TaskQueryBuildError { .. } => "task_query_build_error",
        }
    }

    /// Whether the outer scheduler should consider retrying the step after
    /// this error, as opposed to treating it as terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceClaimRejected(_))
    }
}
