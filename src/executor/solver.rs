//! Built-in solver steps.

use async_trait::async_trait;

use super::SampleContext;
use crate::Result;
use crate::cache::CachePolicy;
use crate::sample::TaskState;
use crate::traits::Solver;
use crate::types::GenerateConfig;

/// Calls the model once on the current conversation.
///
/// ```rust
/// # use evalrun::{CachePolicy, GenerateConfig, GenerateSolver};
/// let step = GenerateSolver::new()
///     .config(GenerateConfig::new().temperature(0.0))
///     .cache(CachePolicy::new().per_epoch(false));
/// ```
#[derive(Debug, Clone, Default)]
pub struct GenerateSolver {
    config: GenerateConfig,
    cache: Option<CachePolicy>,
}

impl GenerateSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: GenerateConfig) -> Self {
        self.config = config;
        self
    }

    /// Cache this step's generation under `policy`.
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }
}

#[async_trait]
impl Solver for GenerateSolver {
    fn name(&self) -> &str {
        "generate"
    }

    async fn solve(&self, state: &mut TaskState, ctx: &SampleContext<'_>) -> Result<()> {
        ctx.generate(state, &self.config, self.cache.as_ref())
            .await
            .map(|_| ())
    }
}
