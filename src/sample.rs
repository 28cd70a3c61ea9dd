//! Samples, their mutable state, and their terminal outcomes.

use serde::{Deserialize, Serialize};

use crate::limits::{LimitExceeded, LimitUsage, Limits};
use crate::retry::{Checkpointed, ErrorRecord};
use crate::types::{Message, ModelOutput, ToolChoice, ToolDefinition, Usage};

/// One dataset item.
///
/// ```rust
/// # use evalrun::{Limits, Message, Sample};
/// let sample = Sample::new("q-17", vec![Message::user("What is 2 + 2?")])
///     .limits(Limits::none().message_limit(10));
/// assert_eq!(sample.id, "q-17");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub input: Vec<Message>,
    /// Overrides for the task-level limits. Unset ceilings fall back to the
    /// task's.
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

impl Sample {
    pub fn new(id: impl Into<String>, input: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            input,
            limits: Limits::none(),
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Snapshot {
    messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    tool_choice: Option<ToolChoice>,
    output: Option<ModelOutput>,
    completed_steps: usize,
    step_checkpoints: u32,
}

/// Mutable conversation state of a running sample.
///
/// Solvers read and write it freely. The executor checkpoints it after each
/// completed plan step; a solver may add resume points inside its own step
/// with [`TaskState::checkpoint`]. Before a retry the state is always
/// restored: to the latest resume point when the error left the state
/// consistent, otherwise to the start of the failed step
/// ([`Checkpointed::rollback`]). Token usage is never restored: tokens spent
/// on a discarded attempt were still spent.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub sample_id: String,
    pub epoch: u32,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    /// Output of the most recent generation call.
    pub output: Option<ModelOutput>,
    /// Model-reported usage summed across generation calls.
    pub usage: Usage,
    completed_steps: usize,
    step_checkpoints: u32,
    step_start: Snapshot,
    resume_point: Option<Snapshot>,
}

impl TaskState {
    pub fn new(sample: &Sample, epoch: u32) -> Self {
        let mut state = Self {
            sample_id: sample.id.clone(),
            epoch,
            messages: sample.input.clone(),
            tools: sample.tools.clone(),
            tool_choice: sample.tool_choice.clone(),
            output: None,
            usage: Usage::default(),
            completed_steps: 0,
            step_checkpoints: 0,
            step_start: Snapshot::default(),
            resume_point: None,
        };
        state.begin_step();
        state
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            messages: self.messages.clone(),
            tools: self.tools.clone(),
            tool_choice: self.tool_choice.clone(),
            output: self.output.clone(),
            completed_steps: self.completed_steps,
            step_checkpoints: self.step_checkpoints,
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        let Snapshot {
            messages,
            tools,
            tool_choice,
            output,
            completed_steps,
            step_checkpoints,
        } = snapshot;
        self.messages = messages;
        self.tools = tools;
        self.tool_choice = tool_choice;
        self.output = output;
        self.completed_steps = completed_steps;
        self.step_checkpoints = step_checkpoints;
    }

    fn begin_step(&mut self) {
        self.step_checkpoints = 0;
        self.step_start = self.snapshot();
        self.resume_point = None;
    }

    /// Record a resume point inside the current plan step.
    ///
    /// A retry after a consistent error restores this state and re-runs the
    /// step; [`step_checkpoints`](Self::step_checkpoints) tells the step how
    /// many of its resume points it already passed, so it can skip that
    /// work.
    pub fn checkpoint(&mut self) {
        self.step_checkpoints += 1;
        self.resume_point = Some(self.snapshot());
    }

    /// Number of plan steps completed so far.
    pub fn completed_steps(&self) -> usize {
        self.completed_steps
    }

    /// Resume points the current step recorded before the state was last
    /// restored. Zero on a step's first run.
    pub fn step_checkpoints(&self) -> u32 {
        self.step_checkpoints
    }

    pub(crate) fn complete_step(&mut self) {
        self.completed_steps += 1;
        self.begin_step();
    }

    /// Text of the most recent generation, if any.
    pub fn output_text(&self) -> Option<&str> {
        self.output.as_ref().map(|o| o.content.as_str())
    }
}

impl Checkpointed for TaskState {
    fn restore_resume_point(&mut self) {
        let snapshot = self
            .resume_point
            .clone()
            .unwrap_or_else(|| self.step_start.clone());
        self.restore(snapshot);
    }

    fn rollback(&mut self) {
        self.restore(self.step_start.clone());
        self.resume_point = None;
    }
}

/// How a sample ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SampleStatus {
    Completed,
    /// Exited early on a limit. Not a failure; the partial output stands.
    LimitExited { limit: LimitExceeded },
    Failed { error: ErrorRecord },
    /// Cancelled because the run aborted.
    Cancelled,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Completed => "completed",
            SampleStatus::LimitExited { .. } => "limit_exited",
            SampleStatus::Failed { .. } => "failed",
            SampleStatus::Cancelled => "cancelled",
        }
    }

    /// Only failures count against the run's failure threshold.
    pub fn is_failure(&self) -> bool {
        matches!(self, SampleStatus::Failed { .. })
    }
}

/// Terminal record of one sample epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutcome {
    pub id: String,
    pub epoch: u32,
    pub status: SampleStatus,
    /// Final conversation (partial for limit exits and cancellations).
    pub messages: Vec<Message>,
    pub output: Option<ModelOutput>,
    pub retries: u32,
    /// Errors that triggered retries, oldest first.
    pub retry_errors: Vec<ErrorRecord>,
    /// Generation calls answered from the cache.
    pub cache_hits: u32,
    /// Generation calls that reached the model.
    pub generations: u32,
    pub model_usage: Usage,
    pub usage: LimitUsage,
}

impl SampleOutcome {
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    pub fn limit(&self) -> Option<&LimitExceeded> {
        match &self.status {
            SampleStatus::LimitExited { limit } => Some(limit),
            _ => None,
        }
    }
}
