//! Model generator decorators.
//!
//! [`ModelGenerator`](crate::ModelGenerator) implementations live outside
//! this crate; this module provides wrappers that add behaviour around any
//! of them.

mod retry;

pub use retry::{RATE_LIMIT_RESOURCE, RetryConfig, RetryingGenerator};
