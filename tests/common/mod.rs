//! Shared mocks for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use evalrun::{
    EvalError, GenerateRequest, GenerateSolver, LimitTracker, Message, ModelGenerator,
    ModelOutput, Result, Sample, Solver, Usage,
};

/// Mock generator that fails N times, then answers every call.
///
/// Replies are numbered by call (`reply #1`, `reply #2`, ...) so a cache hit
/// is recognisable by its stale number.
pub struct MockGenerator {
    name: String,
    failures: AtomicU32,
    fail_with: fn() -> EvalError,
    calls: AtomicU32,
    usage: Usage,
    delay: Duration,
}

impl MockGenerator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failures: AtomicU32::new(0),
            fail_with: || EvalError::Http("connection reset".into()),
            calls: AtomicU32::new(0),
            usage: Usage::new(10, 5),
            delay: Duration::ZERO,
        }
    }

    /// Fail the first `n` calls with `fail_with`.
    pub fn failing(mut self, n: u32, fail_with: fn() -> EvalError) -> Self {
        self.failures = AtomicU32::new(n);
        self.fail_with = fail_with;
        self
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Time each call takes (counts as working time).
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelGenerator for MockGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        _request: &GenerateRequest<'_>,
        _tracker: &LimitTracker,
    ) -> Result<ModelOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err((self.fail_with)());
        }
        Ok(ModelOutput::text(&self.name, format!("reply #{call}")).with_usage(self.usage.clone()))
    }
}

pub fn sample(id: &str) -> Sample {
    Sample::new(id, vec![Message::user(format!("question {id}"))])
}

pub fn samples(n: usize) -> Vec<Sample> {
    (0..n).map(|i| sample(&format!("s{i:02}"))).collect()
}

/// `steps` uncached generation steps.
pub fn generate_plan(steps: usize) -> Vec<Arc<dyn Solver>> {
    (0..steps)
        .map(|_| Arc::new(GenerateSolver::new()) as Arc<dyn Solver>)
        .collect()
}
