use evalrun::{
    ErrorRecord, EvalError, FailOnError, FailureThreshold, LimitExceeded, LimitKind, SampleStatus,
};

fn failed() -> SampleStatus {
    SampleStatus::Failed {
        error: ErrorRecord::new(0, &EvalError::Fatal("boom".into())),
    }
}

fn limit_exited() -> SampleStatus {
    SampleStatus::LimitExited {
        limit: LimitExceeded::new(LimitKind::Message, 30.0, 30.0),
    }
}

#[test]
fn fraction_of_known_total() {
    let threshold = FailureThreshold::new(FailOnError::Fraction(0.1)).unwrap();
    threshold.set_total(20);

    assert!(!threshold.report(&failed())); // 1/20
    assert!(!threshold.report(&failed())); // 2/20 is not more than 10%
    assert!(threshold.report(&failed())); // 3/20
    assert_eq!(threshold.failed(), 3);
}

#[test]
fn fraction_of_enumerated_when_total_unknown() {
    let threshold = FailureThreshold::new(FailOnError::Fraction(0.5)).unwrap();
    for _ in 0..4 {
        threshold.record_enumerated();
    }
    assert!(!threshold.report(&failed())); // 1/4
    assert!(!threshold.report(&failed())); // 2/4
    assert!(threshold.report(&failed())); // 3/4
}

#[test]
fn count_tolerance() {
    let threshold = FailureThreshold::new(FailOnError::Count(2)).unwrap();
    assert!(!threshold.report(&failed()));
    assert!(!threshold.report(&failed()));
    assert!(threshold.report(&failed()));
}

#[test]
fn first_failure_aborts_by_default() {
    let threshold = FailureThreshold::default();
    assert_eq!(threshold.tolerance(), FailOnError::Bool(true));
    assert!(!threshold.should_abort());
    assert!(threshold.report(&failed()));
}

#[test]
fn limit_exits_never_count_as_failures() {
    let threshold = FailureThreshold::default();
    for _ in 0..100 {
        assert!(!threshold.report(&limit_exited()));
        assert!(!threshold.report(&SampleStatus::Completed));
        assert!(!threshold.report(&SampleStatus::Cancelled));
    }
    assert_eq!(threshold.failed(), 0);
}

#[test]
fn abort_is_latched() {
    let threshold = FailureThreshold::new(FailOnError::Fraction(0.5)).unwrap();
    threshold.set_total(2);
    threshold.report(&failed());
    threshold.report(&failed());
    assert!(threshold.should_abort());

    // More successes would dilute the fraction; the decision stands.
    threshold.set_total(1_000);
    assert!(threshold.should_abort());
}
