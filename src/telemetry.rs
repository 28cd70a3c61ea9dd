//! Telemetry metric name constants.
//!
//! Centralised metric names for evalrun operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `evalrun_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `model` - model name reported by the generator
//! - `status` - sample outcome: "completed", "limit_exited", "failed", "cancelled"
//! - `kind` - limit kind or error kind
//! - `resource` - contended resource a sample waited on

/// Total upstream generation requests (cache misses that reached the model).
///
/// Labels: `model`, `status` ("ok" | "error").
pub const GENERATE_REQUESTS_TOTAL: &str = "evalrun_generate_requests_total";

/// Upstream generation duration in seconds.
///
/// Labels: `model`.
pub const GENERATE_DURATION_SECONDS: &str = "evalrun_generate_duration_seconds";

/// Transport-level retry attempts (not counting the initial request).
///
/// Labels: `model`.
pub const TRANSPORT_RETRIES_TOTAL: &str = "evalrun_transport_retries_total";

/// Sample-level retries after a retryable failure.
///
/// Labels: `kind` (error kind).
pub const SAMPLE_RETRIES_TOTAL: &str = "evalrun_sample_retries_total";

/// Total tokens consumed.
///
/// Labels: `model`, `direction` ("prompt" | "completion").
pub const TOKENS_TOTAL: &str = "evalrun_tokens_total";

/// Total cache hits.
///
/// Labels: `model`.
pub const CACHE_HITS_TOTAL: &str = "evalrun_cache_hits_total";

/// Total cache misses (including expired entries).
///
/// Labels: `model`.
pub const CACHE_MISSES_TOTAL: &str = "evalrun_cache_misses_total";

/// Cache storage failures that degraded to a miss or a skipped write.
///
/// Labels: `operation` ("get" | "put" | "prune" | "clear" | "list").
pub const CACHE_ERRORS_TOTAL: &str = "evalrun_cache_errors_total";

/// Samples that exited early on a limit.
///
/// Labels: `kind`.
pub const LIMIT_EXITS_TOTAL: &str = "evalrun_limit_exits_total";

/// Samples reaching a terminal state.
///
/// Labels: `status`.
pub const SAMPLES_TOTAL: &str = "evalrun_samples_total";

/// Time a sample spent blocked on a shared resource, in seconds.
///
/// Labels: `resource`.
pub const WAIT_DURATION_SECONDS: &str = "evalrun_wait_duration_seconds";

/// Runs aborted because the failure threshold was crossed.
pub const RUNS_ABORTED_TOTAL: &str = "evalrun_runs_aborted_total";
