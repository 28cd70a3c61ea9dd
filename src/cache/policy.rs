//! Per-call cache policy.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{EvalError, Result};

/// Default expiry for cached generations: one week.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

/// How a generation call uses the cache.
///
/// Attached to each generation call rather than set globally, so one sample
/// can cache its expensive calls and leave the rest alone.
///
/// ```rust
/// # use evalrun::cache::CachePolicy;
/// # use std::time::Duration;
/// let policy = CachePolicy::new()
///     .expiry(Duration::from_secs(3600))
///     .per_epoch(false)
///     .scope("role", "grader");
/// assert_eq!(policy.scopes.get("role").map(String::as_str), Some("grader"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Time-to-live for entries written under this policy. `None` = never
    /// expires. Config files accept `"1W"`, `"3D"`, `"12h"`, `"never"`, or
    /// plain seconds. Default: one week.
    #[serde(default = "default_expiry", with = "expiry_serde")]
    pub expiry: Option<Duration>,
    /// Whether the epoch index is part of the key, so every epoch gets its
    /// own generation. Default: true.
    #[serde(default = "default_per_epoch")]
    pub per_epoch: bool,
    /// Named scope labels. They partition the key space and allow clearing
    /// one partition independently.
    #[serde(default)]
    pub scopes: BTreeMap<String, String>,
}

fn default_expiry() -> Option<Duration> {
    Some(DEFAULT_EXPIRY)
}

fn default_per_epoch() -> bool {
    true
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            expiry: default_expiry(),
            per_epoch: default_per_epoch(),
            scopes: BTreeMap::new(),
        }
    }
}

impl CachePolicy {
    /// Create a policy with the default one-week expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time-to-live.
    pub fn expiry(mut self, ttl: Duration) -> Self {
        self.expiry = Some(ttl);
        self
    }

    /// Entries written under this policy never expire.
    pub fn never_expire(mut self) -> Self {
        self.expiry = None;
        self
    }

    /// Include (or exclude) the epoch in the key.
    pub fn per_epoch(mut self, enabled: bool) -> Self {
        self.per_epoch = enabled;
        self
    }

    /// Add a scope label.
    pub fn scope(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.scopes.insert(name.into(), value.into());
        self
    }
}

/// Parse a compact expiry string.
///
/// `<n><unit>` with units `s`, `m`, `h`, `D`, `W`, `M` (30 days) and `Y`
/// (365 days); `never`/`none` means no expiry. Lowercase `d`, `w`, `y` are
/// accepted too; `m` is always minutes.
pub fn parse_expiry(text: &str) -> Result<Option<Duration>> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("never") || text.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid_expiry(text))?;
    let (count, unit) = text.split_at(split);
    let count: u64 = count.parse().map_err(|_| invalid_expiry(text))?;
    let unit_secs: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "D" | "d" => 24 * 3600,
        "W" | "w" => 7 * 24 * 3600,
        "M" => 30 * 24 * 3600,
        "Y" | "y" => 365 * 24 * 3600,
        _ => return Err(invalid_expiry(text)),
    };
    let secs = count
        .checked_mul(unit_secs)
        .ok_or_else(|| invalid_expiry(text))?;
    Ok(Some(Duration::from_secs(secs)))
}

fn invalid_expiry(text: &str) -> EvalError {
    EvalError::Configuration(format!(
        "invalid cache expiry '{text}' (expected e.g. '30m', '1D', '1W', or 'never')"
    ))
}

mod expiry_serde {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&format!("{}s", d.as_secs())),
            None => s.serialize_str("never"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Seconds(secs) => Ok(Some(Duration::from_secs(secs))),
            Raw::Text(text) => parse_expiry(&text).map_err(serde::de::Error::custom),
        }
    }
}
