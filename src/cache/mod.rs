//! Generation cache.
//!
//! Generation calls are expensive and, for a fixed prompt, configuration and
//! epoch, worth replaying across runs. The cache has three parts:
//!
//! - [`CacheKey`]: a deterministic SHA-256 fingerprint of everything that
//!   influences a generation (model, endpoint, messages, tools, sampling
//!   configuration, epoch, scope labels).
//! - [`CachePolicy`]: attached to each generation call; sets the entry's
//!   expiry, whether the epoch participates in the key, and scope labels.
//! - [`CacheStore`]: the on-disk store with a moka front layer. Expired
//!   entries read as misses and stay on disk until [`CacheStore::prune`].
//!
//! # Layout
//!
//! ```text
//! <cache dir>/
//!   openai_gpt-4o/
//!     3f5a…e1.json
//!     9b02…7c.json
//!   local_llama3/
//!     …
//! ```
//!
//! One file per entry, written atomically (temp file + rename). The model
//! directory makes clearing by model a directory walk instead of a full
//! scan.

mod key;
mod policy;
mod store;

pub use key::CacheKey;
pub use policy::{CachePolicy, DEFAULT_EXPIRY, parse_expiry};
pub use store::{
    CACHE_DIR_ENV, CacheConfig, CacheEntry, CacheEntryInfo, CacheFilter, CacheStore,
    default_cache_dir,
};
