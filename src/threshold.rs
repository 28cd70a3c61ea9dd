//! Run-level failure tolerance.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::sample::SampleStatus;
use crate::telemetry;
use crate::{EvalError, Result};

/// How many failed samples a run tolerates.
///
/// In config files: `fail_on_error = true`, `false`, a count (`3`), or a
/// fraction (`0.1`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailOnError {
    /// `true` aborts on the first failure; `false` never aborts.
    Bool(bool),
    /// Abort once more than this many samples failed.
    Count(u64),
    /// Abort once more than this fraction of samples failed.
    Fraction(f64),
}

impl Default for FailOnError {
    fn default() -> Self {
        FailOnError::Bool(true)
    }
}

impl FailOnError {
    pub fn validate(&self) -> Result<()> {
        match *self {
            FailOnError::Count(0) => Err(EvalError::Configuration(
                "fail_on_error count must be at least 1 (use true to abort on the first failure)"
                    .into(),
            )),
            FailOnError::Fraction(f) if !(f > 0.0 && f <= 1.0) => Err(EvalError::Configuration(
                format!("fail_on_error fraction must be in (0, 1], got {f}"),
            )),
            _ => Ok(()),
        }
    }
}

/// What happens to in-flight samples once the run aborts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortPolicy {
    /// Cancel them at their next checkpoint.
    #[default]
    Cancel,
    /// Let them finish; only stop scheduling new samples.
    Drain,
}

/// Task-scoped failure counter, shared across workers via `Arc`.
///
/// Fractions are measured against the expected total when it is known, and
/// otherwise against the number of samples enumerated so far; the latter
/// is the conservative choice while a lazy dataset is still being read.
/// Once the tolerance is crossed [`should_abort`](Self::should_abort) stays
/// true for the rest of the run.
#[derive(Debug)]
pub struct FailureThreshold {
    tolerance: FailOnError,
    failed: AtomicU64,
    /// 0 = unknown.
    expected_total: AtomicU64,
    enumerated: AtomicU64,
    aborted: AtomicBool,
}

impl Default for FailureThreshold {
    /// Abort on the first failure.
    fn default() -> Self {
        Self {
            tolerance: FailOnError::default(),
            failed: AtomicU64::new(0),
            expected_total: AtomicU64::new(0),
            enumerated: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
        }
    }
}

impl FailureThreshold {
    pub fn new(tolerance: FailOnError) -> Result<Self> {
        tolerance.validate()?;
        Ok(Self {
            tolerance,
            ..Self::default()
        })
    }

    pub fn tolerance(&self) -> FailOnError {
        self.tolerance
    }

    /// Fix the expected number of samples once it is known.
    pub fn set_total(&self, total: u64) {
        self.expected_total.store(total, Ordering::SeqCst);
    }

    /// Count one more enumerated sample.
    pub fn record_enumerated(&self) {
        self.enumerated.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a terminal sample status. Returns whether the run is aborting.
    pub fn report(&self, status: &SampleStatus) -> bool {
        if status.is_failure() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.should_abort()
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Whether the tolerance has been crossed.
    pub fn should_abort(&self) -> bool {
        if self.aborted.load(Ordering::SeqCst) {
            return true;
        }
        if !self.exceeded() {
            return false;
        }
        if !self.aborted.swap(true, Ordering::SeqCst) {
            metrics::counter!(telemetry::RUNS_ABORTED_TOTAL).increment(1);
            warn!(
                failed = self.failed(),
                tolerance = ?self.tolerance,
                "failure threshold exceeded, aborting run"
            );
        }
        true
    }

    fn exceeded(&self) -> bool {
        let failed = self.failed();
        match self.tolerance {
            FailOnError::Bool(abort) => abort && failed > 0,
            FailOnError::Count(count) => failed > count,
            FailOnError::Fraction(fraction) => {
                let total = match self.expected_total.load(Ordering::SeqCst) {
                    0 => self.enumerated.load(Ordering::SeqCst),
                    total => total,
                };
                // At least the failed samples themselves were enumerated.
                let total = total.max(failed);
                total > 0 && failed as f64 / total as f64 > fraction
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> SampleStatus {
        SampleStatus::Failed {
            error: crate::retry::ErrorRecord::new(0, &EvalError::Fatal("boom".into())),
        }
    }

    #[test]
    fn tolerance_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            fail_on_error: FailOnError,
        }
        let parse = |s: &str| toml::from_str::<Wrapper>(s).unwrap().fail_on_error;
        assert_eq!(parse("fail_on_error = true"), FailOnError::Bool(true));
        assert_eq!(parse("fail_on_error = 3"), FailOnError::Count(3));
        assert_eq!(parse("fail_on_error = 0.25"), FailOnError::Fraction(0.25));
    }

    #[test]
    fn invalid_tolerances_rejected() {
        assert!(FailureThreshold::new(FailOnError::Count(0)).is_err());
        assert!(FailureThreshold::new(FailOnError::Fraction(0.0)).is_err());
        assert!(FailureThreshold::new(FailOnError::Fraction(1.5)).is_err());
        assert!(FailureThreshold::new(FailOnError::Fraction(f64::NAN)).is_err());
        assert!(FailureThreshold::new(FailOnError::Fraction(1.0)).is_ok());
    }

    #[test]
    fn never_abort_when_false() {
        let threshold = FailureThreshold::new(FailOnError::Bool(false)).unwrap();
        for _ in 0..100 {
            assert!(!threshold.report(&failed()));
        }
    }

    #[test]
    fn unknown_total_uses_enumerated_count() {
        let threshold = FailureThreshold::new(FailOnError::Fraction(0.5)).unwrap();
        for _ in 0..4 {
            threshold.record_enumerated();
        }
        assert!(!threshold.report(&failed()));
        assert!(!threshold.report(&failed()));
        // 3 of 4 enumerated
        assert!(threshold.report(&failed()));
    }
}
