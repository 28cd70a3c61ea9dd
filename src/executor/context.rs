//! What a solver sees while a sample runs.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::resource::ResourcePool;
use crate::cache::{CacheKey, CachePolicy, CacheStore};
use crate::limits::{LimitExceeded, LimitTracker, TrackerEvent};
use crate::sample::TaskState;
use crate::telemetry;
use crate::traits::ModelGenerator;
use crate::types::{GenerateConfig, GenerateRequest, Message, ModelOutput};
use crate::{EvalError, Result};

/// Per-sample handle passed to every [`Solver`](crate::Solver) step.
///
/// Every operation here is a checkpoint: limits are checked and the run's
/// cancellation flag is polled, so a solver that only talks to the outside
/// world through its context stops promptly when the sample must end.
pub struct SampleContext<'a> {
    generator: &'a dyn ModelGenerator,
    cache: Option<&'a CacheStore>,
    tracker: &'a LimitTracker,
    cancel: &'a CancellationToken,
    epoch: u32,
    cache_hits: AtomicU32,
    generations: AtomicU32,
}

impl<'a> SampleContext<'a> {
    pub(crate) fn new(
        generator: &'a dyn ModelGenerator,
        cache: Option<&'a CacheStore>,
        tracker: &'a LimitTracker,
            cancel: &'a CancellationToken,
        epoch: u32,
    ) -> Self {
        Self {
            generator,
            cache,
            tracker,
            cancel,
            epoch,
            cache_hits: AtomicU32::new(0),
            generations: AtomicU32::new(0),
        }
    }

    pub fn tracker(&self) -> &LimitTracker {
        self.tracker
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Generation calls answered from the cache so far.
    pub fn cache_hits(&self) -> u32 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Generation calls that reached the model so far.
    pub fn generations(&self) -> u32 {
        self.generations.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EvalError::Cancelled);
        }
        Ok(())
    }

    /// Checkpoint: fails with [`EvalError::Cancelled`] if the run is
    /// aborting, or [`EvalError::LimitExceeded`] if a ceiling was crossed.
    pub fn check_limits(&self) -> Result<()> {
        self.check_cancelled()?;
        self.tracker.check()?;
        Ok(())
    }

    /// Signal a caller-defined limit; reported at the next checkpoint.
    pub fn signal_limit(&self, exceeded: LimitExceeded) {
        self.tracker.signal(exceeded);
    }

    /// Run one generation call against the current conversation.
    ///
    /// With a cache policy the cache is consulted first and a fresh output
    /// is stored on success. Either way the output's token usage is
    /// accounted, the assistant reply is appended to the conversation and
    /// `state.output` is replaced.
    pub async fn generate(
        &self,
        state: &mut TaskState,
        config: &GenerateConfig,
        policy: Option<&CachePolicy>,
    ) -> Result<ModelOutput> {
        self.check_cancelled()?;
        self.tracker.check_before_generate(state.messages.len())?;

        let output = {
            let mut request = GenerateRequest::new(&state.messages, config).tools(&state.tools);
            if let Some(choice) = &state.tool_choice {
                request = request.tool_choice(choice);
            }
            let cached = match (self.cache, policy) {
                (Some(store), Some(policy)) => self
                    .cache_key(&request, policy)
                    .map(|key| (store, policy, key)),
                _ => None,
            };

            let hit = match &cached {
                Some((store, _, key)) => store.get(key).await,
                None => None,
            };
            match hit {
                Some(entry) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    entry.output.clone()
                }
                None => {
                    let output = self.call_model(&request).await?;
                    if let Some((store, policy, key)) = &cached {
                        store.put(key, output.clone(), policy).await;
                    }
                    output
                }
            }
        };

        // Cached outputs count their recorded usage too, so limits behave
        // the same with or without the cache.
        if let Some(usage) = &output.usage {
            state.usage.add(usage);
        }
        self.tracker
            .account(TrackerEvent::TokensConsumed(output.total_tokens()));

        let reply = if output.tool_calls.is_empty() {
            Message::assistant(output.content.clone())
        } else {
            Message::assistant_with_tool_calls(
                Some(output.content.clone()),
                output.tool_calls.clone(),
            )
        };
        state.messages.push(reply);
        self.tracker.account(TrackerEvent::MessageAppended);
        state.output = Some(output.clone());

        self.check_limits()?;
        Ok(output)
    }

    fn cache_key(&self, request: &GenerateRequest<'_>, policy: &CachePolicy) -> Option<CacheKey> {
        match CacheKey::compute(
            self.generator.name(),
            self.generator.base_url(),
            request,
            self.epoch,
            policy,
        ) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "failed to compute cache key, bypassing cache");
                None
            }
        }
    }

    async fn call_model(&self, request: &GenerateRequest<'_>) -> Result<ModelOutput> {
        let model = self.generator.name();
        self.tracker.account(TrackerEvent::GenerationStarted);
        let started = Instant::now();
        let result = self.generator.generate(request, self.tracker).await;
        metrics::histogram!(telemetry::GENERATE_DURATION_SECONDS, "model" => model.to_owned())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(output) => {
                self.tracker.account(TrackerEvent::GenerationSucceeded);
                self.generations.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::GENERATE_REQUESTS_TOTAL, "model" => model.to_owned(), "status" => "ok")
                    .increment(1);
                if let Some(usage) = &output.usage {
                    metrics::counter!(telemetry::TOKENS_TOTAL, "model" => model.to_owned(), "direction" => "prompt")
                        .increment(u64::from(usage.prompt_tokens));
                    metrics::counter!(telemetry::TOKENS_TOTAL, "model" => model.to_owned(), "direction" => "completion")
                        .increment(u64::from(usage.completion_tokens));
                }
                debug!(model, tokens = output.total_tokens(), "generation complete");
                Ok(output)
            }
            Err(e) => {
                self.tracker.account(TrackerEvent::GenerationFailed);
                metrics::counter!(telemetry::GENERATE_REQUESTS_TOTAL, "model" => model.to_owned(), "status" => "error")
                    .increment(1);
                debug!(model, error = %e, "generation failed");
                Err(e)
            }
        }
    }

    /// Append a message to the conversation and check limits.
    pub fn append_message(&self, state: &mut TaskState, message: Message) -> Result<()> {
        state.messages.push(message);
        self.tracker.account(TrackerEvent::MessageAppended);
        self.check_limits()
    }

    /// Await `fut` while accounting the time as a wait on `resource`, so it
    /// does not count against the working-time limit.
    pub async fn wait_for<F: Future>(&self, resource: &str, fut: F) -> F::Output {
        self.tracker.wait_for(resource, fut).await
    }

    /// Take a slot from a shared pool. The queueing time is a wait; the run
    /// aborting while queued yields [`EvalError::Cancelled`].
    pub async fn acquire(&self, pool: &ResourcePool) -> Result<OwnedSemaphorePermit> {
        self.check_cancelled()?;
        tokio::select! {
            permit = pool.acquire(self.tracker) => permit,
            _ = self.cancel.cancelled() => Err(EvalError::Cancelled),
        }
    }

    /// Record a resume point inside the current step and check limits.
    ///
    /// A retry after a transport error restores `state` to this point and
    /// re-runs the step, with [`TaskState::step_checkpoints`] counting the
    /// resume points already passed.
    pub fn checkpoint(&self, state: &mut TaskState) -> Result<()> {
        state.checkpoint();
        self.check_limits()
    }
}
