//! Generation request

use super::config::GenerateConfig;
use super::message::Message;
use super::tool::{ToolChoice, ToolDefinition};

/// Everything a model sees for one generation call.
///
/// Borrowed from the sample's state; the same value feeds the cache key and
/// the upstream request, so a cache hit always corresponds to the exact
/// prompt that would have been sent.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
    pub tool_choice: Option<&'a ToolChoice>,
    pub config: &'a GenerateConfig,
}

impl<'a> GenerateRequest<'a> {
    pub fn new(messages: &'a [Message], config: &'a GenerateConfig) -> Self {
        Self {
            messages,
            tools: &[],
            tool_choice: None,
            config,
        }
    }

    pub fn tools(mut self, tools: &'a [ToolDefinition]) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool_choice(mut self, choice: &'a ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }
}
