use std::time::Duration;

use evalrun::{
    CacheKey, CachePolicy, GenerateConfig, GenerateRequest, Message, ToolChoice, ToolDefinition,
};
use serde_json::json;

fn search_tool() -> ToolDefinition {
    ToolDefinition::new(
        "search",
        "Search the web",
        json!({"type": "object", "properties": {"q": {"type": "string"}}}),
    )
}

fn calc_tool() -> ToolDefinition {
    ToolDefinition::new(
        "calculator",
        "Evaluate arithmetic",
        json!({"type": "object", "properties": {"expr": {"type": "string"}}}),
    )
}

struct Call {
    model: &'static str,
    base_url: Option<&'static str>,
    messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    tool_choice: Option<ToolChoice>,
    config: GenerateConfig,
    epoch: u32,
    policy: CachePolicy,
}

impl Call {
    fn new() -> Self {
        Self {
            model: "openai/gpt-4o",
            base_url: None,
            messages: vec![
                Message::system("You are terse."),
                Message::user("What is 2 + 2?"),
            ],
            tools: vec![search_tool(), calc_tool()],
            tool_choice: None,
            config: GenerateConfig::new().temperature(0.7).max_tokens(256),
            epoch: 1,
            policy: CachePolicy::default(),
        }
    }

    fn key(&self) -> CacheKey {
        let mut request = GenerateRequest::new(&self.messages, &self.config).tools(&self.tools);
        if let Some(choice) = &self.tool_choice {
            request = request.tool_choice(choice);
        }
        CacheKey::compute(self.model, self.base_url, &request, self.epoch, &self.policy).unwrap()
    }
}

#[test]
fn identical_calls_share_a_key() {
    assert_eq!(Call::new().key(), Call::new().key());
    assert_eq!(Call::new().key().digest(), Call::new().key().digest());
}

#[test]
fn model_changes_key() {
    let mut other = Call::new();
    other.model = "anthropic/claude";
    assert_ne!(Call::new().key().digest(), other.key().digest());
}

#[test]
fn base_url_changes_key() {
    let mut other = Call::new();
    other.base_url = Some("http://localhost:8000/v1");
    assert_ne!(Call::new().key().digest(), other.key().digest());
}

#[test]
fn any_message_changes_key() {
    let mut other = Call::new();
    other.messages[0] = Message::system("You are verbose.");
    assert_ne!(Call::new().key(), other.key());

    let mut appended = Call::new();
    appended.messages.push(Message::assistant("4"));
    assert_ne!(Call::new().key(), appended.key());
}

#[test]
fn message_order_matters() {
    let mut swapped = Call::new();
    swapped.messages.reverse();
    assert_ne!(Call::new().key(), swapped.key());
}

#[test]
fn sampling_config_changes_key() {
    let mut other = Call::new();
    other.config = other.config.temperature(0.8);
    assert_ne!(Call::new().key(), other.key());

    let mut seeded = Call::new();
    seeded.config = seeded.config.seed(42);
    assert_ne!(Call::new().key(), seeded.key());
}

#[test]
fn transport_settings_do_not_change_key() {
    let mut other = Call::new();
    other.config = other
        .config
        .timeout(Duration::from_secs(5))
        .max_retries(9);
    assert_eq!(Call::new().key(), other.key());
}

#[test]
fn tool_set_changes_key_but_not_its_order() {
    let mut fewer = Call::new();
    fewer.tools.pop();
    assert_ne!(Call::new().key(), fewer.key());

    let mut reordered = Call::new();
    reordered.tools.reverse();
    assert_eq!(Call::new().key(), reordered.key());
}

#[test]
fn same_named_tools_do_not_depend_on_order() {
    let narrow = ToolDefinition::new(
        "search",
        "Search the docs",
        json!({"type": "object", "properties": {"q": {"type": "string"}}}),
    );
    let mut first = Call::new();
    first.tools = vec![search_tool(), narrow.clone()];
    let mut second = Call::new();
    second.tools = vec![narrow, search_tool()];
    assert_eq!(first.key(), second.key());
    assert_ne!(first.key(), Call::new().key());
}

#[test]
fn tool_choice_changes_key() {
    let mut other = Call::new();
    other.tool_choice = Some(ToolChoice::None);
    assert_ne!(Call::new().key(), other.key());
}

#[test]
fn epoch_changes_key_when_per_epoch() {
    let mut other = Call::new();
    other.epoch = 2;
    assert_ne!(Call::new().key(), other.key());
    assert_eq!(other.key().epoch(), Some(2));
}

#[test]
fn epoch_ignored_when_shared_across_epochs() {
    let mut first = Call::new();
    first.policy = CachePolicy::new().per_epoch(false);
    let mut second = Call::new();
    second.policy = CachePolicy::new().per_epoch(false);
    second.epoch = 7;
    assert_eq!(first.key(), second.key());
    assert_eq!(first.key().epoch(), None);
}

#[test]
fn scopes_partition_keys() {
    let mut grader = Call::new();
    grader.policy = CachePolicy::new().scope("role", "grader");
    assert_ne!(Call::new().key(), grader.key());

    let mut both = Call::new();
    both.policy = CachePolicy::new().scope("a", "1").scope("b", "2");
    let mut both_reversed = Call::new();
    both_reversed.policy = CachePolicy::new().scope("b", "2").scope("a", "1");
    assert_eq!(both.key(), both_reversed.key());
}

#[test]
fn expiry_does_not_change_key() {
    let mut other = Call::new();
    other.policy = CachePolicy::new().expiry(Duration::from_secs(60));
    assert_eq!(Call::new().key(), other.key());
}
