mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{MockGenerator, generate_plan, samples};
use evalrun::{
    AbortPolicy, CachePolicy, CacheStore, EvalError, FailOnError, FailureThreshold,
    GenerateSolver, Result, RetryController, SampleContext, SampleExecutor, SampleStatus,
    Scheduler, Solver, TaskState,
};

fn bad_request() -> EvalError {
    EvalError::Fatal("bad request".into())
}

fn tolerate_all() -> Arc<FailureThreshold> {
    Arc::new(FailureThreshold::new(FailOnError::Bool(false)).unwrap())
}

/// Records how many samples are inside `solve` at once.
#[derive(Default)]
struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
}

#[async_trait]
impl Solver for ConcurrencyProbe {
    fn name(&self) -> &str {
        "probe"
    }

    async fn solve(&self, _state: &mut TaskState, _ctx: &SampleContext<'_>) -> Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Panics on one sample.
struct PanicOn(&'static str);

#[async_trait]
impl Solver for PanicOn {
    fn name(&self) -> &str {
        "panic_on"
    }

    async fn solve(&self, state: &mut TaskState, _ctx: &SampleContext<'_>) -> Result<()> {
        if state.sample_id == self.0 {
            panic!("boom in {}", state.sample_id);
        }
        Ok(())
    }
}

/// Sleeps until cancelled, checking in like a long tool loop would.
struct LongLoop;

#[async_trait]
impl Solver for LongLoop {
    fn name(&self) -> &str {
        "long_loop"
    }

    async fn solve(&self, _state: &mut TaskState, ctx: &SampleContext<'_>) -> Result<()> {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ctx.check_limits()?;
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn concurrency_is_bounded() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let plan: Vec<Arc<dyn Solver>> = vec![probe.clone()];
    let executor = Arc::new(SampleExecutor::new(Arc::new(MockGenerator::new("mock")), plan));

    let summary = Scheduler::new(executor)
        .max_samples(4)
        .run_all(samples(20))
        .await;

    assert_eq!(summary.total, 20);
    assert_eq!(summary.completed, 20);
    assert_eq!(probe.max.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn epochs_expand_in_dataset_order() {
    let generator = Arc::new(MockGenerator::new("mock"));
    let executor = Arc::new(SampleExecutor::new(generator.clone(), generate_plan(1)));

    let summary = Scheduler::new(executor)
        .epochs(2)
        .run_all(samples(3))
        .await;

    assert_eq!(summary.total, 6);
    assert_eq!(generator.calls(), 6);
    let order: Vec<(&str, u32)> = summary
        .outcomes
        .iter()
        .map(|o| (o.id.as_str(), o.epoch))
        .collect();
    assert_eq!(
        order,
        vec![
            ("s00", 1),
            ("s00", 2),
            ("s01", 1),
            ("s01", 2),
            ("s02", 1),
            ("s02", 2)
        ]
    );
    assert!(summary.outcome("s01", 2).is_some());
    assert!(summary.outcome("s01", 3).is_none());
}

#[tokio::test]
async fn first_failure_aborts_and_cancels() {
    let generator = Arc::new(MockGenerator::new("mock").failing(u32::MAX, bad_request));
    let executor = Arc::new(SampleExecutor::new(generator, generate_plan(1)));

    let summary = Scheduler::new(executor.clone())
        .max_samples(2)
        .run_all(samples(10))
        .await;

    assert!(summary.aborted);
    assert!(summary.failed >= 1);
    assert!(summary.total < 10);
    assert_eq!(summary.failed + summary.cancelled, summary.total);
    assert!(executor.cancellation_token().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn cancel_policy_stops_in_flight_samples() {
    struct FailFast;

    #[async_trait]
    impl Solver for FailFast {
        fn name(&self) -> &str {
            "fail_fast"
        }

        async fn solve(&self, state: &mut TaskState, ctx: &SampleContext<'_>) -> Result<()> {
            if state.sample_id == "s00" {
                return Err(EvalError::Fatal("broken sample".into()));
            }
            LongLoop.solve(state, ctx).await
        }
    }

    let plan: Vec<Arc<dyn Solver>> = vec![Arc::new(FailFast)];
    let executor = Arc::new(SampleExecutor::new(Arc::new(MockGenerator::new("mock")), plan));

    let summary = Scheduler::new(executor)
        .max_samples(3)
        .run_all(samples(6))
        .await;

    assert!(summary.aborted);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.cancelled, 2);
    assert_eq!(summary.total, 3);
    let cancelled = summary.outcome("s01", 1).unwrap();
    assert_eq!(cancelled.status, SampleStatus::Cancelled);
    // Stopped at the first checkpoint, not after the whole loop.
    assert!(cancelled.usage.wall_time <= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn drain_policy_lets_in_flight_samples_finish() {
    let generator = Arc::new(
        MockGenerator::new("mock")
            .delay(Duration::from_secs(1))
            .failing(1, bad_request),
    );
    let executor = Arc::new(
        SampleExecutor::new(generator, generate_plan(1)).abort_policy(AbortPolicy::Drain),
    );

    let summary = Scheduler::new(executor.clone())
        .max_samples(3)
        .run_all(samples(10))
        .await;

    assert!(summary.aborted);
    assert_eq!(summary.cancelled, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.total, 3);
    assert!(!executor.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn panicking_sample_fails_without_killing_the_run() {
    let plan: Vec<Arc<dyn Solver>> = vec![Arc::new(PanicOn("s03"))];
    let executor = Arc::new(
        SampleExecutor::new(Arc::new(MockGenerator::new("mock")), plan).threshold(tolerate_all()),
    );

    let summary = Scheduler::new(executor).run_all(samples(8)).await;

    assert_eq!(summary.total, 8);
    assert_eq!(summary.completed, 7);
    assert_eq!(summary.failed, 1);
    match &summary.outcome("s03", 1).unwrap().status {
        SampleStatus::Failed { error } => {
            assert_eq!(error.kind, "fatal");
            assert!(error.message.contains("boom in s03"), "{}", error.message);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn lazy_dataset_aborts_on_fraction_of_enumerated() {
    let generator = Arc::new(MockGenerator::new("mock").failing(u32::MAX, bad_request));
    let threshold = Arc::new(FailureThreshold::new(FailOnError::Fraction(0.5)).unwrap());
    let executor = Arc::new(SampleExecutor::new(generator, generate_plan(1)).threshold(threshold));

    // Unknown length: the first failure is already 100% of what was read.
    let summary = Scheduler::new(executor)
        .max_samples(1)
        .run(samples(10), None)
        .await;

    assert!(summary.aborted);
    assert_eq!(summary.total, 1);
}

#[tokio::test]
async fn tolerated_failures_do_not_abort() {
    let generator = Arc::new(MockGenerator::new("mock").failing(2, bad_request));
    let threshold = Arc::new(FailureThreshold::new(FailOnError::Count(2)).unwrap());
    let executor = Arc::new(SampleExecutor::new(generator, generate_plan(1)).threshold(threshold));

    let summary = Scheduler::new(executor)
        .max_samples(1)
        .run_all(samples(10))
        .await;

    assert!(!summary.aborted);
    assert_eq!(summary.total, 10);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.completed, 8);
}

#[tokio::test]
async fn summary_counts_retries() {
    let generator = Arc::new(MockGenerator::new("mock").failing(3, || {
        EvalError::Http("connection reset".into())
    }));
    let executor = Arc::new(
        SampleExecutor::new(generator, generate_plan(1)).retry(RetryController::new(5)),
    );

    let summary = Scheduler::new(executor)
        .max_samples(1)
        .run_all(samples(4))
        .await;

    assert_eq!(summary.completed, 4);
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.total_retries, 3);
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CacheStore::open(dir.path()));
    let generator = Arc::new(MockGenerator::new("mock"));
    let plan: Vec<Arc<dyn Solver>> = vec![Arc::new(GenerateSolver::new().cache(CachePolicy::new()))];
    let scheduler = || {
        let executor = Arc::new(
            SampleExecutor::new(generator.clone(), plan.clone()).cache(store.clone()),
        );
        Scheduler::new(executor).epochs(2)
    };

    let first = scheduler().run_all(samples(5)).await;
    assert_eq!(first.completed, 10);
    assert_eq!(first.cache_hits, 0);
    assert_eq!(generator.calls(), 10);

    let second = scheduler().run_all(samples(5)).await;
    assert_eq!(second.completed, 10);
    assert_eq!(second.cached, 10);
    assert_eq!(second.cache_hits, 10);
    assert_eq!(generator.calls(), 10);
    for (a, b) in first.outcomes.iter().zip(&second.outcomes) {
        assert_eq!(a.output, b.output);
    }
}
