//! Content-addressed cache keys.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use super::CachePolicy;
use crate::Result;
use crate::types::{GenerateConfig, GenerateRequest};
use crate::version::CACHE_FORMAT;

/// Fingerprint of one generation call.
///
/// Composed of the model identity (name and base endpoint), the prompt
/// (messages in order, tool definitions, tool choice), the sampling
/// configuration, the epoch when the policy is per-epoch, and the policy's
/// scope labels. Rendered as a lowercase SHA-256 hex digest of a canonical
/// JSON document with sorted object keys and fixed-precision floats, so the
/// same call produces the same key in every process.
///
/// Two keys are equal when their model and digest are equal; `base_url` and
/// `epoch` are carried along for the entry metadata only.
#[derive(Debug, Clone)]
pub struct CacheKey {
    model: String,
    base_url: Option<String>,
    epoch: Option<u32>,
    digest: String,
}

impl CacheKey {
    /// Compute the key for a generation call.
    pub fn compute(
        model: &str,
        base_url: Option<&str>,
        request: &GenerateRequest<'_>,
        epoch: u32,
        policy: &CachePolicy,
    ) -> Result<Self> {
        // Tool definitions are a set: order them by name, then by their
        // canonical form, so registration order never changes the key.
        let mut tools = request
            .tools
            .iter()
            .map(|tool| -> Result<(String, String, Value)> {
                let value = canonicalize_json(&serde_json::to_value(tool)?);
                let text = serde_json::to_string(&value)?;
                Ok((tool.name.clone(), text, value))
            })
            .collect::<Result<Vec<_>>>()?;
        tools.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        let tools: Vec<Value> = tools.into_iter().map(|(_, _, value)| value).collect();

        let mut doc = json!({
            // Bumping the format makes old entries stop matching.
            "version": CACHE_FORMAT,
            "model": model,
            "base_url": base_url,
            "messages": serde_json::to_value(request.messages)?,
            "tools": tools,
            "tool_choice": serde_json::to_value(request.tool_choice)?,
            "config": config_value(request.config),
            "scopes": serde_json::to_value(&policy.scopes)?,
        });
        let epoch = policy.per_epoch.then_some(epoch);
        if let Some(epoch) = epoch {
            doc["epoch"] = json!(epoch);
        }

        let canonical = serde_json::to_vec(&canonicalize_json(&doc))?;
        let digest = format!("{:x}", Sha256::digest(&canonical));

        Ok(Self {
            model: model.to_string(),
            base_url: base_url.map(str::to_string),
            epoch,
            digest,
        })
    }

    /// Rebuild a key from stored entry metadata.
    pub(crate) fn from_parts(
        model: impl Into<String>,
        base_url: Option<String>,
        epoch: Option<u32>,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            base_url,
            epoch,
            digest: digest.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// Epoch folded into the key, if the policy was per-epoch.
    pub fn epoch(&self) -> Option<u32> {
        self.epoch
    }

    /// Lowercase hex SHA-256 digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.model == other.model && self.digest == other.digest
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.model.hash(state);
        self.digest.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

/// Sampling fields only. Floats are rendered at fixed precision so that
/// formatting differences never split a key.
fn config_value(config: &GenerateConfig) -> Value {
    // Destructured so a new field has to be classified here.
    let GenerateConfig {
        temperature,
        max_tokens,
        top_p,
        top_k,
        stop,
        frequency_penalty,
        presence_penalty,
        seed,
        reasoning_effort,
        timeout: _,
        max_retries: _,
    } = config;

    json!({
        "temperature": temperature.map(fixed),
        "max_tokens": max_tokens,
        "top_p": top_p.map(fixed),
        "top_k": top_k,
        "stop": stop,
        "frequency_penalty": frequency_penalty.map(fixed),
        "presence_penalty": presence_penalty.map(fixed),
        "seed": seed,
        "reasoning_effort": reasoning_effort.map(|e| e.as_str()),
    })
}

fn fixed(x: f32) -> String {
    format!("{:.6}", f64::from(x))
}

fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, val) in pairs {
                out.insert(key.clone(), canonicalize_json(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}

/// Directory-safe rendering of a model name (`openai/gpt-4o` → `openai_gpt-4o`).
pub(crate) fn model_dir_name(model: &str) -> String {
    let name: String = model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        name
    }
}
