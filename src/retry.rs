//! Sample-level retry.
//!
//! When an error escapes a sample's plan, the [`RetryController`] decides
//! whether to run the plan again. Before each retry the state is restored:
//! to its last stable point when the error left it consistent, or to its
//! last full checkpoint when the error may have left it half-mutated.
//! Retries never start over from the sample's input. There is no backoff here: transport backoff belongs to
//! [`RetryingGenerator`](crate::generator::RetryingGenerator).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::telemetry;
use crate::{EvalError, Result};

/// State that can be restored before a retry.
pub trait Checkpointed {
    /// Restore the latest point the state can resume from after an error
    /// that left it consistent.
    fn restore_resume_point(&mut self);

    /// Restore the last full checkpoint, discarding resume points taken
    /// since.
    fn rollback(&mut self);
}

/// One error that triggered a retry (or ended the sample).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// 0-indexed attempt that produced the error.
    pub attempt: u32,
    /// Short category, see [`EvalError::kind`].
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(attempt: u32, error: &EvalError) -> Self {
        Self {
            attempt,
            kind: error.kind().to_string(),
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

/// Retry bookkeeping for one sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub retries: u32,
    /// Errors that triggered a retry, oldest first.
    pub errors: Vec<ErrorRecord>,
}

/// Decides which errors are worth a retry.
pub type RetryClassifier = Arc<dyn Fn(&EvalError) -> bool + Send + Sync>;

/// Re-executes a sample's plan on retryable failures, up to `max_retries`
/// times.
///
/// ```rust
/// # use evalrun::retry::RetryController;
/// # use evalrun::EvalError;
/// let controller = RetryController::new(3)
///     .with_classifier(|e| e.is_transient() || matches!(e, EvalError::EmptyResponse));
/// assert_eq!(controller.max_retries(), 3);
/// ```
#[derive(Clone)]
pub struct RetryController {
    max_retries: u32,
    classifier: RetryClassifier,
}

impl fmt::Debug for RetryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryController")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RetryController {
    /// Retry transient errors up to `max_retries` times.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            classifier: Arc::new(EvalError::is_transient),
        }
    }

    /// Never retry.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Replace the retry predicate.
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&EvalError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether `error` should trigger a retry. Limit exits and cancellation
    /// are control flow and never retried, whatever the classifier says.
    pub fn is_retryable(&self, error: &EvalError) -> bool {
        !matches!(
            error,
            EvalError::LimitExceeded(_) | EvalError::Cancelled | EvalError::RetriesExhausted { .. }
        ) && (self.classifier)(error)
    }

    /// Run `attempt_fn` until it succeeds, fails fatally, or the retry
    /// budget runs out.
    ///
    /// `attempt_fn` takes the state by value and hands it back along with
    /// the attempt's result, so the controller can restore it between
    /// attempts. Every error that triggers a retry is appended to `record`.
    /// When the budget runs out the error is wrapped in
    /// [`EvalError::RetriesExhausted`]; with a budget of zero the original
    /// error is returned as-is.
    pub async fn execute_with_retry<S, T, F, Fut>(
        &self,
        record: &mut RetryRecord,
        mut state: S,
        mut attempt_fn: F,
    ) -> (S, Result<T>)
    where
        S: Checkpointed,
        F: FnMut(S, u32) -> Fut,
        Fut: Future<Output = (S, Result<T>)>,
    {
        let mut attempt = 0;
        loop {
            let (next, result) = attempt_fn(state, attempt).await;
            state = next;
            let error = match result {
                Ok(value) => return (state, Ok(value)),
                Err(error) => error,
            };

            if !self.is_retryable(&error) {
                debug!(attempt, kind = error.kind(), error = %error, "not retrying");
                return (state, Err(error));
            }
            if attempt >= self.max_retries {
                if self.max_retries == 0 {
                    return (state, Err(error));
                }
                warn!(
                    attempts = attempt + 1,
                    kind = error.kind(),
                    error = %error,
                    "sample retries exhausted"
                );
                return (
                    state,
                    Err(EvalError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(error),
                    }),
                );
            }

            metrics::counter!(telemetry::SAMPLE_RETRIES_TOTAL, "kind" => error.kind())
                .increment(1);
            warn!(
                attempt = attempt + 1,
                max_retries = self.max_retries,
                kind = error.kind(),
                error = %error,
                "retrying sample after error"
            );
            if error.leaves_state_consistent() {
                state.restore_resume_point();
            } else {
                state.rollback();
            }
            record.errors.push(ErrorRecord::new(attempt, &error));
            record.retries += 1;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Steps {
        committed: Vec<u32>,
        resumable: Vec<u32>,
        pending: Vec<u32>,
        resumes: u32,
        rollbacks: u32,
    }

    impl Checkpointed for Steps {
        fn restore_resume_point(&mut self) {
            self.pending.clone_from(&self.resumable);
            self.resumes += 1;
        }

        fn rollback(&mut self) {
            self.pending.clear();
            self.resumable.clear();
            self.rollbacks += 1;
        }
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let controller = RetryController::new(5);
        let mut record = RetryRecord::default();
        let (_, result) = controller
            .execute_with_retry(&mut record, Steps::default(), |s, _| async move {
                (s, Err::<(), _>(EvalError::AuthenticationFailed))
            })
            .await;
        assert!(matches!(result, Err(EvalError::AuthenticationFailed)));
        assert_eq!(record.retries, 0);
        assert!(record.errors.is_empty());
    }

    #[tokio::test]
    async fn inconsistent_state_is_rolled_back_before_retry() {
        let controller = RetryController::new(1);
        let mut record = RetryRecord::default();
        let (state, result) = controller
            .execute_with_retry(&mut record, Steps::default(), |mut s, attempt| async move {
                s.pending.push(attempt);
                if attempt == 0 {
                    return (
                        s,
                        Err(EvalError::Sandbox {
                            message: "container restarted".into(),
                            transient: true,
                        }),
                    );
                }
                s.committed.append(&mut s.pending);
                (s, Ok(()))
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(state.rollbacks, 1);
        assert_eq!(state.committed, vec![1]);
        assert_eq!(record.errors[0].kind, "sandbox");
    }

    #[tokio::test]
    async fn consistent_error_resumes_from_stable_point() {
        let controller = RetryController::new(1);
        let mut record = RetryRecord::default();
        let (state, result) = controller
            .execute_with_retry(&mut record, Steps::default(), |mut s, attempt| async move {
                if attempt == 0 {
                    s.pending.push(10);
                    s.resumable.clone_from(&s.pending);
                    s.pending.push(attempt);
                    return (s, Err(EvalError::Http("reset".into())));
                }
                s.pending.push(attempt);
                (s, Ok(()))
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(state.resumes, 1);
        assert_eq!(state.rollbacks, 0);
        // Work after the stable point is discarded, work before it kept.
        assert_eq!(state.pending, vec![10, 1]);
    }

    #[tokio::test]
    async fn zero_budget_returns_original_error() {
        let controller = RetryController::disabled();
        let mut record = RetryRecord::default();
        let (_, result) = controller
            .execute_with_retry(&mut record, Steps::default(), |s, _| async move {
                (s, Err::<(), _>(EvalError::EmptyResponse))
            })
            .await;
        assert!(matches!(result, Err(EvalError::EmptyResponse)));
    }

    #[test]
    fn classifier_cannot_retry_control_flow() {
        let controller = RetryController::new(3).with_classifier(|_| true);
        assert!(controller.is_retryable(&EvalError::AuthenticationFailed));
        assert!(!controller.is_retryable(&EvalError::Cancelled));
        assert!(!controller.is_retryable(&EvalError::LimitExceeded(
            crate::limits::LimitExceeded::new(crate::limits::LimitKind::Token, 2.0, 1.0)
        )));
    }
}
