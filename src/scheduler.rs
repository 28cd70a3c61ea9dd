//! Concurrent run scheduling.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

use crate::executor::{SampleExecutor, panicked_outcome};
use crate::sample::{Sample, SampleOutcome, SampleStatus};

/// Aggregate result of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Sample epochs that reached a terminal state.
    pub total: usize,
    pub completed: usize,
    /// Sample epochs with at least one generation served from the cache.
    pub cached: usize,
    /// Sample epochs retried at least once.
    pub retried: usize,
    pub limit_exited: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_retries: u64,
    pub cache_hits: u64,
    /// Whether the failure threshold stopped the run.
    pub aborted: bool,
    /// Terminal outcomes in dataset order.
    #[serde(skip)]
    pub outcomes: Vec<SampleOutcome>,
}

impl RunSummary {
    fn new(outcomes: Vec<SampleOutcome>, aborted: bool) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            aborted,
            ..Self::default()
        };
        for outcome in &outcomes {
            match outcome.status {
                SampleStatus::Completed => summary.completed += 1,
                SampleStatus::LimitExited { .. } => summary.limit_exited += 1,
                SampleStatus::Failed { .. } => summary.failed += 1,
                SampleStatus::Cancelled => summary.cancelled += 1,
            }
            if outcome.cache_hits > 0 {
                summary.cached += 1;
            }
            if outcome.retries > 0 {
                summary.retried += 1;
            }
            summary.total_retries += u64::from(outcome.retries);
            summary.cache_hits += u64::from(outcome.cache_hits);
        }
        summary.outcomes = outcomes;
        summary
    }

    /// Outcome of one sample epoch.
    pub fn outcome(&self, id: &str, epoch: u32) -> Option<&SampleOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.id == id && o.epoch == epoch)
    }
}

/// Runs a dataset through a [`SampleExecutor`] with bounded concurrency.
///
/// Every sample runs once per epoch (epochs are numbered from 1). Before a
/// sample epoch is scheduled the failure threshold is consulted; once it
/// trips, nothing new is scheduled and, under
/// [`AbortPolicy::Cancel`](crate::AbortPolicy::Cancel), in-flight samples
/// stop at their next checkpoint. Outcomes already reached are kept.
pub struct Scheduler {
    executor: Arc<SampleExecutor>,
    max_samples: usize,
    epochs: u32,
}

impl Scheduler {
    pub fn new(executor: Arc<SampleExecutor>) -> Self {
        Self {
            executor,
            max_samples: 16,
            epochs: 1,
        }
    }

    /// Maximum sample epochs in flight. Default: 16.
    pub fn max_samples(mut self, n: usize) -> Self {
        self.max_samples = n.max(1);
        self
    }

    /// Repetitions per sample. Default: 1.
    pub fn epochs(mut self, n: u32) -> Self {
        self.epochs = n.max(1);
        self
    }

    /// Run every sample of a fully materialised dataset.
    pub async fn run_all(&self, samples: Vec<Sample>) -> RunSummary {
        let total = samples.len();
        self.run(samples, Some(total)).await
    }

    /// Run samples as they are enumerated. `expected_total` is the number of
    /// samples (not epochs) when known in advance.
    pub async fn run<I>(&self, samples: I, expected_total: Option<usize>) -> RunSummary
    where
        I: IntoIterator<Item = Sample>,
    {
        let threshold = self.executor.failure_threshold().clone();
        let cancel = self.executor.cancellation_token().clone();
        let epochs = u64::from(self.epochs);
        if let Some(total) = expected_total {
            threshold.set_total(total as u64 * epochs);
        }
        info!(
            max_samples = self.max_samples,
            epochs = self.epochs,
            expected_total,
            "starting run"
        );

        let slots = Arc::new(Semaphore::new(self.max_samples));
        let mut tasks: JoinSet<(usize, SampleOutcome)> = JoinSet::new();
        let mut outcomes = Vec::new();
        let mut enumerated = 0usize;
        let mut exhausted = true;

        'schedule: for sample in samples {
            let sample = Arc::new(sample);
            for epoch in 1..=self.epochs {
                while let Some(joined) = tasks.try_join_next() {
                    collect(joined, &mut outcomes);
                }
                if threshold.should_abort() {
                    exhausted = false;
                    break 'schedule;
                }
                let permit = tokio::select! {
                    permit = slots.clone().acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                let Some(permit) = permit else {
                    exhausted = false;
                    break 'schedule;
                };
                // The threshold may have tripped while waiting for a slot.
                if threshold.should_abort() {
                    exhausted = false;
                    break 'schedule;
                }

                threshold.record_enumerated();
                let index = enumerated;
                enumerated += 1;
                let executor = self.executor.clone();
                let sample = sample.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let outcome = match AssertUnwindSafe(executor.run(&sample, epoch))
                        .catch_unwind()
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(panic) => executor.finish(panicked_outcome(
                            &sample,
                            epoch,
                            &panic_message(panic.as_ref()),
                        )),
                    };
                    (index, outcome)
                });
            }
        }
        if exhausted && expected_total.is_none() {
            threshold.set_total(enumerated as u64);
        }

        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut outcomes);
        }
        outcomes.sort_by_key(|(index, _)| *index);

        let summary = RunSummary::new(
            outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
            threshold.should_abort(),
        );
        info!(
            total = summary.total,
            completed = summary.completed,
            limit_exited = summary.limit_exited,
            failed = summary.failed,
            cancelled = summary.cancelled,
            retries = summary.total_retries,
            cache_hits = summary.cache_hits,
            aborted = summary.aborted,
            "run finished"
        );
        summary
    }
}

fn collect(
    joined: Result<(usize, SampleOutcome), JoinError>,
    outcomes: &mut Vec<(usize, SampleOutcome)>,
) {
    match joined {
        Ok(entry) => outcomes.push(entry),
        // Panics are caught inside the task, so this is an aborted runtime.
        Err(e) => error!(error = %e, "sample task did not complete"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
