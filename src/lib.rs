//! evalrun - concurrent evaluation sample runner
//!
//! Runs a dataset of samples against a model with bounded concurrency. Each
//! sample runs a plan of [`Solver`] steps; generation calls go through a
//! content-addressed [`CacheStore`], every sample is held to its [`Limits`]
//! (wall time, working time, messages, tokens), transient failures are
//! retried by a [`RetryController`], and a [`FailureThreshold`] aborts the
//! run once too many samples fail.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use evalrun::{
//!     CachePolicy, CacheStore, GenerateRequest, GenerateSolver, LimitTracker, Message,
//!     ModelGenerator, ModelOutput, RunConfig, Sample, Solver,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ModelGenerator for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn generate(
//!         &self,
//!         request: &GenerateRequest<'_>,
//!         _tracker: &LimitTracker,
//!     ) -> evalrun::Result<ModelOutput> {
//!         let last = request.messages.last().map(Message::text).unwrap_or_default();
//!         Ok(ModelOutput::text("echo", last))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> evalrun::Result<()> {
//!     let config = RunConfig::load(None)?;
//!     let cache = Arc::new(CacheStore::new(&config.cache_config()));
//!     let plan: Vec<Arc<dyn Solver>> =
//!         vec![Arc::new(GenerateSolver::new().cache(CachePolicy::new()))];
//!     let executor = Arc::new(config.executor(Arc::new(Echo), plan, Some(cache))?);
//!
//!     let samples = vec![Sample::new("greeting", vec![Message::user("hello")])];
//!     let summary = config.scheduler(executor).run_all(samples).await;
//!     println!("{} completed, {} failed", summary.completed, summary.failed);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod generator;
pub mod limits;
pub mod retry;
pub mod sample;
pub mod scheduler;
pub mod telemetry;
pub mod threshold;
pub mod traits;
pub mod types;
pub mod version;

// Re-export main types at crate root
pub use cache::{CacheConfig, CacheEntry, CacheFilter, CacheKey, CachePolicy, CacheStore};
pub use config::RunConfig;
pub use error::{EvalError, Result};
pub use executor::{GenerateSolver, ResourcePool, SampleContext, SampleExecutor};
pub use generator::{RetryConfig, RetryingGenerator};
pub use limits::{LimitExceeded, LimitKind, LimitTracker, LimitUsage, Limits, TrackerEvent};
pub use retry::{ErrorRecord, RetryController, RetryRecord};
pub use sample::{Sample, SampleOutcome, SampleStatus, TaskState};
pub use scheduler::{RunSummary, Scheduler};
pub use threshold::{AbortPolicy, FailOnError, FailureThreshold};
pub use traits::{ModelGenerator, Solver};
pub use types::{
    FinishReason, GenerateConfig, GenerateRequest, Message, MessageContent, ModelOutput,
    ReasoningEffort, Role, ToolCall, ToolChoice, ToolDefinition, Usage,
};
pub use version::PKG_VERSION;
