//! Single-sample execution.
//!
//! [`SampleExecutor`] drives one sample epoch from input to terminal
//! outcome: it resolves the sample's limits, runs the solver plan under the
//! [`RetryController`], maps the final result to a [`SampleStatus`] and
//! reports it to the run's [`FailureThreshold`].
//!
//! ```text
//! run(sample, epoch)
//!   └─ RetryController::execute_with_retry
//!        └─ for each remaining solver step
//!             ├─ checkpoint: cancelled? limits?
//!             ├─ Solver::solve(state, ctx)
//!             │    ├─ ctx.generate: cache get → model → cache put → account
//!             │    └─ ctx.checkpoint: optional resume point inside the step
//!             └─ TaskState step checkpoint
//! ```

mod context;
mod resource;
mod solver;

pub use context::SampleContext;
pub use resource::ResourcePool;
pub use solver::GenerateSolver;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cache::CacheStore;
use crate::limits::{LimitTracker, Limits, TrackerEvent};
use crate::retry::{ErrorRecord, RetryController, RetryRecord};
use crate::sample::{Sample, SampleOutcome, SampleStatus, TaskState};
use crate::telemetry;
use crate::threshold::{AbortPolicy, FailureThreshold};
use crate::traits::{ModelGenerator, Solver};
use crate::{EvalError, Result};

/// Runs samples against one model with one solver plan.
///
/// Cheap to share: the scheduler wraps it in an `Arc` and runs many samples
/// through it concurrently. The cache, the failure threshold and the
/// cancellation token are injected so several executors can share them.
pub struct SampleExecutor {
    generator: Arc<dyn ModelGenerator>,
    plan: Vec<Arc<dyn Solver>>,
    cache: Option<Arc<CacheStore>>,
    retry: RetryController,
    limits: Limits,
    threshold: Arc<FailureThreshold>,
    abort_policy: AbortPolicy,
    cancel: CancellationToken,
}

impl SampleExecutor {
    /// An executor with no cache, no retries, no limits, and a run that
    /// aborts on the first failure.
    pub fn new(generator: Arc<dyn ModelGenerator>, plan: Vec<Arc<dyn Solver>>) -> Self {
        Self {
            generator,
            plan,
            cache: None,
            retry: RetryController::disabled(),
            limits: Limits::none(),
            threshold: Arc::new(FailureThreshold::default()),
            abort_policy: AbortPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cache(mut self, store: Arc<CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    pub fn retry(mut self, controller: RetryController) -> Self {
        self.retry = controller;
        self
    }

    /// Task-level limits; each sample's own limits override them.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn threshold(mut self, threshold: Arc<FailureThreshold>) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn abort_policy(mut self, policy: AbortPolicy) -> Self {
        self.abort_policy = policy;
        self
    }

    /// Token polled at every checkpoint. Cancelled when the run aborts under
    /// [`AbortPolicy::Cancel`].
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn failure_threshold(&self) -> &Arc<FailureThreshold> {
        &self.threshold
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one sample epoch to its terminal outcome and report it.
    pub async fn run(&self, sample: &Sample, epoch: u32) -> SampleOutcome {
        let span = info_span!("sample", id = %sample.id, epoch);
        let outcome = self.run_inner(sample, epoch).instrument(span).await;
        self.finish(outcome)
    }

    async fn run_inner(&self, sample: &Sample, epoch: u32) -> SampleOutcome {
        let limits = self.limits.overridden_by(&sample.limits);
        let state = TaskState::new(sample, epoch);
        let tracker = LimitTracker::with_messages(limits, state.messages.len());
        let ctx = SampleContext::new(
            self.generator.as_ref(),
            self.cache.as_deref(),
            &tracker,
            &self.cancel,
            epoch,
        );
        let mut record = RetryRecord::default();

        let (state, result) = if self.cancel.is_cancelled() {
            (state, Err(EvalError::Cancelled))
        } else {
            self.retry
                .execute_with_retry(&mut record, state, |state, attempt| {
                    self.run_plan(&ctx, state, attempt)
                })
                .await
        };

        let status = match result {
            Ok(()) => SampleStatus::Completed,
            Err(EvalError::LimitExceeded(limit)) => {
                metrics::counter!(telemetry::LIMIT_EXITS_TOTAL, "kind" => limit.kind.to_string())
                    .increment(1);
                info!(
                    kind = %limit.kind,
                    value = limit.value,
                    limit = limit.limit,
                    "sample exited on limit"
                );
                SampleStatus::LimitExited { limit }
            }
            Err(EvalError::Cancelled) => {
                debug!("sample cancelled");
                SampleStatus::Cancelled
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, retries = record.retries, "sample failed");
                SampleStatus::Failed {
                    error: ErrorRecord::new(record.retries, &e),
                }
            }
        };

        SampleOutcome {
            id: sample.id.clone(),
            epoch,
            status,
            messages: state.messages,
            output: state.output,
            retries: record.retries,
            retry_errors: record.errors,
            cache_hits: ctx.cache_hits(),
            generations: ctx.generations(),
            model_usage: state.usage,
            usage: tracker.usage(),
        }
    }

    async fn run_plan(
        &self,
        ctx: &SampleContext<'_>,
        mut state: TaskState,
        attempt: u32,
    ) -> (TaskState, Result<()>) {
        let result = self.run_steps(ctx, &mut state, attempt).await;
        (state, result)
    }

    async fn run_steps(
        &self,
        ctx: &SampleContext<'_>,
        state: &mut TaskState,
        attempt: u32,
    ) -> Result<()> {
        // The state was restored to a checkpoint before this attempt.
        ctx.tracker().set_message_count(state.messages.len());
        let resume_at = state.completed_steps();
        if attempt > 0 {
            ctx.tracker().account(TrackerEvent::SampleRetried);
            debug!(
                attempt,
                resume_at,
                step_checkpoints = state.step_checkpoints(),
                "resuming plan"
            );
        }
        for solver in self.plan.iter().skip(resume_at) {
            ctx.check_limits()?;
            debug!(step = solver.name(), "running solver step");
            solver.solve(state, ctx).await?;
            state.complete_step();
        }
        Ok(())
    }

    /// Report the terminal outcome and trigger cancellation when the run
    /// starts aborting.
    pub(crate) fn finish(&self, outcome: SampleOutcome) -> SampleOutcome {
        metrics::counter!(telemetry::SAMPLES_TOTAL, "status" => outcome.status.as_str())
            .increment(1);
        if self.threshold.report(&outcome.status) && self.abort_policy == AbortPolicy::Cancel {
            self.cancel.cancel();
        }
        outcome
    }
}

/// Outcome for a sample whose task panicked.
pub(crate) fn panicked_outcome(sample: &Sample, epoch: u32, message: &str) -> SampleOutcome {
    let error = EvalError::Fatal(format!("sample panicked: {message}"));
    warn!(id = %sample.id, epoch, error = %error, "sample panicked");
    SampleOutcome {
        id: sample.id.clone(),
        epoch,
        status: SampleStatus::Failed {
            error: ErrorRecord::new(0, &error),
        },
        messages: sample.input.clone(),
        output: None,
        retries: 0,
        retry_errors: Vec::new(),
        cache_hits: 0,
        generations: 0,
        model_usage: Default::default(),
        usage: Default::default(),
    }
}
