//! Conversation, prompt and output types shared by the cache, the executor
//! and model generators.

mod config;
mod message;
mod request;
mod response;
mod tool;

pub use config::{GenerateConfig, ReasoningEffort};
pub use message::{Message, MessageContent, Role};
pub use request::GenerateRequest;
pub use response::{FinishReason, ModelOutput, Usage};
pub use tool::{ToolCall, ToolChoice, ToolDefinition};
