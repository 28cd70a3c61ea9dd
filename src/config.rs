//! Run configuration.
//!
//! Resolution order:
//! 1. Explicit path (`--config` flag)
//! 2. `~/.evalrun/config.toml` (user)
//! 3. `/etc/evalrun/config.toml` (system)
//!
//! With no file anywhere the defaults apply. Every section and field is
//! optional:
//!
//! ```toml
//! [run]
//! max_samples = 8
//! epochs = 3
//! fail_on_error = 0.1      # true | false | count | fraction
//! retry_on_error = 2
//! abort_policy = "cancel"  # or "drain"
//!
//! [limits]
//! time_limit = 600
//! working_limit = 300
//! message_limit = 30
//! token_limit = 100000
//!
//! [cache]
//! dir = "/var/cache/evalrun"
//! memory_entries = 1000
//!
//! [cache.policy]
//! expiry = "1W"
//! per_epoch = true
//!
//! [transport]
//! max_attempts = 3
//! initial_delay = 0.5
//! max_delay = 30
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheConfig, CachePolicy, CacheStore, default_cache_dir};
use crate::executor::SampleExecutor;
use crate::generator::{RetryConfig, RetryingGenerator};
use crate::limits::Limits;
use crate::retry::RetryController;
use crate::scheduler::Scheduler;
use crate::threshold::{AbortPolicy, FailOnError, FailureThreshold};
use crate::traits::{ModelGenerator, Solver};
use crate::{EvalError, Result};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub run: RunSection,
    pub limits: Limits,
    pub cache: CacheSection,
    pub transport: RetryConfig,
}

/// `[run]`: scheduling and failure handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    /// Sample epochs in flight at once. Default: 16.
    pub max_samples: usize,
    /// Repetitions per sample. Default: 1.
    pub epochs: u32,
    /// Failure tolerance. Default: abort on the first failure.
    pub fail_on_error: FailOnError,
    /// Sample-level retries for transient errors. Default: 0.
    pub retry_on_error: u32,
    pub abort_policy: AbortPolicy,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_samples: 16,
            epochs: 1,
            fail_on_error: FailOnError::default(),
            retry_on_error: 0,
            abort_policy: AbortPolicy::default(),
        }
    }
}

/// `[cache]`: storage location and the default policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    /// Storage directory. Default: `$EVALRUN_CACHE_DIR` or the platform
    /// cache directory.
    pub dir: Option<PathBuf>,
    /// In-memory front layer capacity. Default: 1,000.
    pub memory_entries: u64,
    /// Policy for solvers that cache without choosing one themselves.
    pub policy: CachePolicy,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: None,
            memory_entries: 1_000,
            policy: CachePolicy::default(),
        }
    }
}

impl RunConfig {
    /// Load configuration from the standard locations, falling back to the
    /// defaults when no file exists. An explicit path must exist.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EvalError::Configuration(format!("failed to read config file {path:?}: {e}"))
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            EvalError::Configuration(msg) => {
                EvalError::Configuration(format!("{msg} (in {path:?})"))
            }
            other => other,
        })?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EvalError::Configuration(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(EvalError::Configuration(format!(
                "config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".evalrun").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        let system_config = PathBuf::from("/etc/evalrun/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    pub fn validate(&self) -> Result<()> {
        self.run.fail_on_error.validate()?;
        if self.run.max_samples == 0 {
            return Err(EvalError::Configuration(
                "run.max_samples must be at least 1".into(),
            ));
        }
        if self.run.epochs == 0 {
            return Err(EvalError::Configuration(
                "run.epochs must be at least 1".into(),
            ));
        }
        if self.transport.max_attempts == 0 {
            return Err(EvalError::Configuration(
                "transport.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .dir(self.cache_dir())
            .max_memory_entries(self.cache.memory_entries)
    }

    pub fn retry_controller(&self) -> RetryController {
        RetryController::new(self.run.retry_on_error)
    }

    pub fn failure_threshold(&self) -> Result<FailureThreshold> {
        FailureThreshold::new(self.run.fail_on_error)
    }

    /// Build an executor from this configuration. The generator gets
    /// transport retries unless `transport.max_attempts` is 1.
    pub fn executor(
        &self,
        generator: Arc<dyn ModelGenerator>,
        plan: Vec<Arc<dyn Solver>>,
        cache: Option<Arc<CacheStore>>,
    ) -> Result<SampleExecutor> {
        self.validate()?;
        let generator: Arc<dyn ModelGenerator> = if self.transport.max_attempts > 1 {
            Arc::new(RetryingGenerator::new(generator, self.transport.clone()))
        } else {
            generator
        };
        let mut executor = SampleExecutor::new(generator, plan)
            .retry(self.retry_controller())
            .limits(self.limits)
            .threshold(Arc::new(self.failure_threshold()?))
            .abort_policy(self.run.abort_policy);
        if let Some(store) = cache {
            executor = executor.cache(store);
        }
        Ok(executor)
    }

    pub fn scheduler(&self, executor: Arc<SampleExecutor>) -> Scheduler {
        Scheduler::new(executor)
            .max_samples(self.run.max_samples)
            .epochs(self.run.epochs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = RunConfig::from_toml("").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.run.max_samples, 16);
        assert_eq!(config.run.fail_on_error, FailOnError::Bool(true));
        assert!(config.limits.is_unlimited());
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(RunConfig::from_toml("[run]\nmax_sample = 4").is_err());
    }

    #[test]
    fn invalid_tolerance_rejected_at_load() {
        let err = RunConfig::from_toml("[run]\nfail_on_error = 2.5").unwrap_err();
        assert!(matches!(err, EvalError::Configuration(_)));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = RunConfig::load(Some(Path::new("/nonexistent/evalrun.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
