//! Core seams: the model a sample talks to and the steps a sample runs.

use async_trait::async_trait;

use crate::Result;
use crate::executor::SampleContext;
use crate::limits::LimitTracker;
use crate::sample::TaskState;
use crate::types::{GenerateRequest, ModelOutput};

/// Upstream model generation.
///
/// Implementations perform one generation call. Time spent blocked on a
/// contended resource (rate-limit backoff, connection pool) should be
/// wrapped in [`LimitTracker::wait_for`] so it is excluded from the
/// sample's working time. Errors carry their own retry hint via
/// [`EvalError::is_transient`](crate::EvalError::is_transient).
#[async_trait]
pub trait ModelGenerator: Send + Sync {
    /// Model identifier. Part of the cache key.
    fn name(&self) -> &str;

    /// Base endpoint, when the same model name can be served from several
    /// places. Part of the cache key.
    fn base_url(&self) -> Option<&str> {
        None
    }

    /// Run one generation call.
    async fn generate(
        &self,
        request: &GenerateRequest<'_>,
        tracker: &LimitTracker,
    ) -> Result<ModelOutput>;
}

/// One step of a sample's plan.
///
/// A sample runs its solvers in order. After every completed step the
/// executor checkpoints the [`TaskState`]; when a retry follows an error
/// that left the state inconsistent, the state is rolled back to that
/// checkpoint and the plan resumes at the failed step.
#[async_trait]
pub trait Solver: Send + Sync {
    fn name(&self) -> &str;

    async fn solve(&self, state: &mut TaskState, ctx: &SampleContext<'_>) -> Result<()>;
}
