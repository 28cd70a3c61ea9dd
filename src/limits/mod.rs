//! Per-sample resource limits.
//!
//! A sample runs under four built-in ceilings plus any number of
//! caller-defined ones:
//!
//! - **time**: wall-clock seconds since the sample started
//! - **working**: wall time minus time spent waiting on contended shared
//!   resources (rate-limit backoff, sandbox queues) and minus time burned by
//!   generation attempts that failed and were retried
//! - **message**: conversation length
//! - **token**: cumulative tokens across every generation call of the sample
//!
//! Limits are configured at task scope and may be overridden per sample with
//! [`Limits::overridden_by`]. Crossing a ceiling produces a
//! [`LimitExceeded`] signal, which ends the sample early but is not a
//! failure. The per-sample accounting lives in [`LimitTracker`].

mod tracker;

pub use tracker::{LimitTracker, LimitUsage, TrackerEvent, WaitGuard};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which ceiling was crossed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Time,
    Working,
    Message,
    Token,
    /// Caller-defined limit signalled out-of-band.
    #[serde(untagged)]
    Custom(String),
}

impl LimitKind {
    pub fn as_str(&self) -> &str {
        match self {
            LimitKind::Time => "time",
            LimitKind::Working => "working",
            LimitKind::Message => "message",
            LimitKind::Token => "token",
            LimitKind::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured early-exit signal.
///
/// `value` and `limit` are seconds for the time kinds and plain counts for
/// everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitExceeded {
    pub kind: LimitKind,
    pub value: f64,
    pub limit: f64,
    pub message: String,
}

impl LimitExceeded {
    /// Build a signal with the standard message for `kind`.
    pub fn new(kind: LimitKind, value: f64, limit: f64) -> Self {
        let message = match &kind {
            LimitKind::Time | LimitKind::Working => format!(
                "{kind} limit exceeded: {value:.1}s elapsed, limit {limit:.1}s"
            ),
            _ => format!("{kind} limit exceeded: {value} used, limit {limit}"),
        };
        Self {
            kind,
            value,
            limit,
            message,
        }
    }

    /// Build a caller-defined limit signal.
    pub fn custom(
        kind: impl Into<String>,
        value: f64,
        limit: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: LimitKind::Custom(kind.into()),
            value,
            limit,
            message: message.into(),
        }
    }
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Resource ceilings for a sample. `None` means unlimited.
///
/// Durations are written as (fractional) seconds in config files:
///
/// ```toml
/// [limits]
/// time_limit = 600
/// working_limit = 300.5
/// message_limit = 30
/// token_limit = 100000
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default, with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<Duration>,
    #[serde(default, with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub working_limit: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<u64>,
}

impl Limits {
    /// No ceilings at all.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn working_limit(mut self, limit: Duration) -> Self {
        self.working_limit = Some(limit);
        self
    }

    pub fn message_limit(mut self, limit: usize) -> Self {
        self.message_limit = Some(limit);
        self
    }

    pub fn token_limit(mut self, limit: u64) -> Self {
        self.token_limit = Some(limit);
        self
    }

    /// Resolve task-scope limits against a narrower scope.
    ///
    /// Every ceiling the narrower scope sets wins; the rest fall back to
    /// `self`.
    pub fn overridden_by(&self, scope: &Limits) -> Limits {
        Limits {
            time_limit: scope.time_limit.or(self.time_limit),
            working_limit: scope.working_limit.or(self.working_limit),
            message_limit: scope.message_limit.or(self.message_limit),
            token_limit: scope.token_limit.or(self.token_limit),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::none()
    }
}

/// `Option<Duration>` as fractional seconds.
mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_f64(d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!(
                "limit must be a non-negative number of seconds, got {s}"
            ))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_scope_overrides_task_scope() {
        let task = Limits::none()
            .message_limit(50)
            .token_limit(1_000)
            .time_limit(Duration::from_secs(60));
        let sample = Limits::none().message_limit(10);

        let resolved = task.overridden_by(&sample);
        assert_eq!(resolved.message_limit, Some(10));
        assert_eq!(resolved.token_limit, Some(1_000));
        assert_eq!(resolved.time_limit, Some(Duration::from_secs(60)));
        assert_eq!(resolved.working_limit, None);
    }

    #[test]
    fn empty_override_keeps_task_limits() {
        let task = Limits::none().token_limit(5);
        assert_eq!(task.overridden_by(&Limits::none()), task);
    }

    #[test]
    fn limits_parse_seconds_from_toml() {
        let limits: Limits = toml::from_str(
            r#"
            time_limit = 600
            working_limit = 1.5
            message_limit = 30
        "#,
        )
        .unwrap();
        assert_eq!(limits.time_limit, Some(Duration::from_secs(600)));
        assert_eq!(limits.working_limit, Some(Duration::from_millis(1500)));
        assert_eq!(limits.message_limit, Some(30));
        assert_eq!(limits.token_limit, None);
    }

    #[test]
    fn negative_seconds_rejected() {
        let result: std::result::Result<Limits, _> = toml::from_str("time_limit = -1");
        assert!(result.is_err());
    }

    #[test]
    fn custom_kind_round_trips_as_plain_string() {
        let kind = LimitKind::Custom("cost".into());
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"cost\"");
        let parsed: LimitKind = serde_json::from_str("\"message\"").unwrap();
        assert_eq!(parsed, LimitKind::Message);
    }

    #[test]
    fn standard_messages_name_the_kind() {
        let limit = LimitExceeded::new(LimitKind::Message, 30.0, 30.0);
        assert!(limit.message.contains("message limit exceeded"));
        let limit = LimitExceeded::new(LimitKind::Working, 12.0, 10.0);
        assert_eq!(
            limit.to_string(),
            "working limit exceeded: 12.0s elapsed, limit 10.0s"
        );
    }
}
