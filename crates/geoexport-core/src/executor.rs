//! The `AsyncSqlExecutor` trait -- the transport the engine submits
//! per-task queries through.
//!
//! This is the concrete form of "the async SQL executor" named throughout
//! the engine's dispatch algorithm: a one-way accept-and-run handoff. The
//! database accepts the query and runs it asynchronously; its completion
//! arrives later as a separate call to
//! [`crate::engine::TaskedStepEngine::on_async_update`]. The trait is
//! intentionally object-safe so steps can be driven through `Arc<dyn
//! AsyncSqlExecutor>` without a generic parameter threading through the
//! whole engine.

use anyhow::Result;
use async_trait::async_trait;

/// A task's share of the step's overall compute-unit claim, consumed for the
/// duration of its database session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceShare {
    pub virtual_units: f64,
}

/// Submits per-task export queries for asynchronous execution.
///
/// # Object Safety
///
/// Every method returns a concrete, non-generic type, so this trait can be
/// stored as `Arc<dyn AsyncSqlExecutor>`.
#[async_trait]
pub trait AsyncSqlExecutor: Send + Sync {
    /// Hand `query` to the database for asynchronous execution against
    /// `task_id`, claiming `share` of the step's resource budget.
    ///
    /// Returns once the database has *accepted* the query, not once it has
    /// finished running it -- completion is reported later and out-of-band
    /// via `on_async_update`.
    async fn submit(&self, task_id: i32, query: &str, share: ResourceShare) -> Result<()>;
}

// Compile-time assertion: AsyncSqlExecutor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AsyncSqlExecutor) {}
};
