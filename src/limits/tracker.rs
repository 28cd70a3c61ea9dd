//! Per-sample limit accounting.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{LimitExceeded, LimitKind, Limits};
use crate::telemetry;

/// Something that happened to a sample that the tracker accounts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// An upstream generation attempt is about to be issued.
    GenerationStarted,
    /// The in-flight generation attempt succeeded.
    GenerationSucceeded,
    /// The in-flight generation attempt failed and will be retried; its
    /// duration is removed from working time.
    GenerationFailedRetryable,
    /// The in-flight generation attempt failed and the error left the
    /// generation call. Its duration is held back until the sample is
    /// retried (see [`TrackerEvent::SampleRetried`]).
    GenerationFailed,
    /// The sample is being re-run after an error. A generation failure that
    /// caused it is removed from working time.
    SampleRetried,
    /// The sample started blocking on a contended shared resource.
    WaitStarted(String),
    /// The matching wait finished.
    WaitEnded(String),
    /// One message was added to the conversation.
    MessageAppended,
    /// Tokens were consumed by a generation call.
    TokensConsumed(u64),
}

/// Point-in-time view of a tracker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitUsage {
    pub wall_time: Duration,
    pub working_time: Duration,
    /// Time excluded from working time because the sample was waiting.
    pub waiting_time: Duration,
    /// Time excluded from working time because attempts failed and were retried.
    pub failed_attempt_time: Duration,
    pub messages: usize,
    pub tokens: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Open waits, innermost last.
    active_waits: Vec<(String, Instant)>,
    /// Start of the current contiguous waiting interval.
    waiting_since: Option<Instant>,
    /// Closed waiting intervals (union, so overlapping waits count once).
    waited: Duration,
    /// Start of the in-flight generation attempt and the waited total at
    /// that moment.
    generation: Option<(Instant, Duration)>,
    failed_attempts: Duration,
    /// Non-waiting time of the last failed generation that no retry has
    /// claimed yet.
    unclaimed_failure: Option<Duration>,
    messages: usize,
    tokens: u64,
    signalled: Option<LimitExceeded>,
}

impl TrackerState {
    /// Time the in-flight generation spent outside of waits.
    fn take_attempt(&mut self, now: Instant) -> Option<Duration> {
        let (started, waited_before) = self.generation.take()?;
        let span = now.saturating_duration_since(started);
        // Waits inside the attempt are already excluded.
        let waited_during = self.waited_at(now).saturating_sub(waited_before);
        Some(span.saturating_sub(waited_during))
    }

    fn waited_at(&self, now: Instant) -> Duration {
        match self.waiting_since {
            Some(since) => self.waited + now.saturating_duration_since(since),
            None => self.waited,
        }
    }
}

/// Accounts wall time, working time, messages and tokens for one sample and
/// checks them against the sample's resolved [`Limits`].
///
/// Owned by the worker running the sample. Methods take `&self` so the
/// tracker can be shared with the generation path and wait guards while the
/// solver holds the conversation mutably; the internal lock is never held
/// across an `.await`.
#[derive(Debug)]
pub struct LimitTracker {
    limits: Limits,
    started: Instant,
    state: Mutex<TrackerState>,
}

impl LimitTracker {
    /// Start tracking now.
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            started: Instant::now(),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Start tracking now with an existing conversation length.
    pub fn with_messages(limits: Limits, messages: usize) -> Self {
        let tracker = Self::new(limits);
        tracker.state().messages = messages;
        tracker
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an event.
    pub fn account(&self, event: TrackerEvent) {
        let now = Instant::now();
        let mut state = self.state();
        match event {
            TrackerEvent::GenerationStarted => {
                let waited = state.waited_at(now);
                state.generation = Some((now, waited));
                state.unclaimed_failure = None;
            }
            TrackerEvent::GenerationSucceeded => {
                state.generation = None;
            }
            TrackerEvent::GenerationFailedRetryable => {
                if let Some(attempt) = state.take_attempt(now) {
                    state.failed_attempts += attempt;
                }
            }
            TrackerEvent::GenerationFailed => {
                if let Some(attempt) = state.take_attempt(now) {
                    state.unclaimed_failure = Some(attempt);
                }
            }
            TrackerEvent::SampleRetried => {
                if let Some(attempt) = state.unclaimed_failure.take() {
                    state.failed_attempts += attempt;
                }
            }
            TrackerEvent::WaitStarted(resource) => {
                if state.active_waits.is_empty() {
                    state.waiting_since = Some(now);
                }
                state.active_waits.push((resource, now));
            }
            TrackerEvent::WaitEnded(resource) => {
                let Some(pos) = state.active_waits.iter().rposition(|(r, _)| *r == resource)
                else {
                    debug!(resource = %resource, "wait ended without a matching start");
                    return;
                };
                let (resource, began) = state.active_waits.remove(pos);
                metrics::histogram!(telemetry::WAIT_DURATION_SECONDS, "resource" => resource)
                    .record(now.saturating_duration_since(began).as_secs_f64());
                if state.active_waits.is_empty() {
                    if let Some(since) = state.waiting_since.take() {
                        state.waited += now.saturating_duration_since(since);
                    }
                }
            }
            TrackerEvent::MessageAppended => {
                state.messages += 1;
            }
            TrackerEvent::TokensConsumed(n) => {
                state.tokens = state.tokens.saturating_add(n);
            }
        }
    }

    /// Reset the message count, e.g. after rolling the conversation back to
    /// a checkpoint.
    pub fn set_message_count(&self, messages: usize) {
        self.state().messages = messages;
    }

    /// Signal a caller-defined limit. The next [`check`](Self::check)
    /// reports it exactly like a built-in kind. The first signal wins.
    pub fn signal(&self, exceeded: LimitExceeded) {
        let mut state = self.state();
        if state.signalled.is_none() {
            state.signalled = Some(exceeded);
        }
    }

    /// Begin a wait on `resource`; the wait ends when the guard drops.
    pub fn begin_wait(&self, resource: impl Into<String>) -> WaitGuard<'_> {
        let resource = resource.into();
        self.account(TrackerEvent::WaitStarted(resource.clone()));
        WaitGuard {
            tracker: self,
            resource: Some(resource),
        }
    }

    /// Await `fut` while accounting the time as a wait on `resource`.
    pub async fn wait_for<F: Future>(&self, resource: impl Into<String>, fut: F) -> F::Output {
        let _guard = self.begin_wait(resource);
        fut.await
    }

    /// Current counters.
    pub fn usage(&self) -> LimitUsage {
        let now = Instant::now();
        let state = self.state();
        self.usage_at(&state, now)
    }

    fn usage_at(&self, state: &TrackerState, now: Instant) -> LimitUsage {
        let wall_time = now.saturating_duration_since(self.started);
        let waiting_time = state.waited_at(now);
        let excluded = waiting_time + state.failed_attempts;
        LimitUsage {
            wall_time,
            working_time: wall_time.saturating_sub(excluded),
            waiting_time,
            failed_attempt_time: state.failed_attempts,
            messages: state.messages,
            tokens: state.tokens,
        }
    }

    /// Check every ceiling. The first one crossed is reported, in the order
    /// custom, time, working, message, token.
    pub fn check(&self) -> Result<(), LimitExceeded> {
        let now = Instant::now();
        let state = self.state();
        if let Some(signalled) = &state.signalled {
            return Err(signalled.clone());
        }
        let usage = self.usage_at(&state, now);
        drop(state);

        if let Some(limit) = self.limits.time_limit {
            if usage.wall_time > limit {
                return Err(LimitExceeded::new(
                    LimitKind::Time,
                    usage.wall_time.as_secs_f64(),
                    limit.as_secs_f64(),
                ));
            }
        }
        if let Some(limit) = self.limits.working_limit {
            if usage.working_time > limit {
                return Err(LimitExceeded::new(
                    LimitKind::Working,
                    usage.working_time.as_secs_f64(),
                    limit.as_secs_f64(),
                ));
            }
        }
        if let Some(limit) = self.limits.message_limit {
            if usage.messages > limit {
                return Err(message_exceeded(usage.messages, limit));
            }
        }
        if let Some(limit) = self.limits.token_limit {
            if usage.tokens > limit {
                return Err(LimitExceeded::new(
                    LimitKind::Token,
                    usage.tokens as f64,
                    limit as f64,
                ));
            }
        }
        Ok(())
    }

    /// Check before issuing a generation call with `messages` conversation
    /// messages. The message ceiling is exclusive here: a call whose input
    /// already has `message_limit` messages would produce a message past the
    /// ceiling, so it is refused before the model is invoked.
    pub fn check_before_generate(&self, messages: usize) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.limits.message_limit {
            if messages >= limit {
                return Err(message_exceeded(messages, limit));
            }
        }
        self.check()
    }
}

fn message_exceeded(messages: usize, limit: usize) -> LimitExceeded {
    LimitExceeded::new(LimitKind::Message, messages as f64, limit as f64)
}

/// RAII wait marker returned by [`LimitTracker::begin_wait`].
#[derive(Debug)]
pub struct WaitGuard<'a> {
    tracker: &'a LimitTracker,
    resource: Option<String>,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.tracker.account(TrackerEvent::WaitEnded(resource));
        }
    }
}
