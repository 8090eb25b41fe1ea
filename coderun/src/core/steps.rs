//! Typed records of an agent run and their message projections.
//!
//! Every record kind knows how to render itself into model messages
//! ([`ToMessages`]). Rendering is a pure function of the record and the
//! [`MessageOptions`] flags, so a stored history always replays to the same
//! conversation.

use serde::{Deserialize, Serialize};

use crate::core::types::{ContentBlock, Message, MessageRole, ToolCall};
use crate::core::value::{Image, WireValue};
use crate::error::AgentError;

/// Flags controlling how records are projected into messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageOptions {
    /// Drop verbose fields (system prompt, raw model text, full plan).
    pub summary_mode: bool,
    /// Re-inject the debug memory snapshot stored on action steps.
    pub include_raw_memory: bool,
}

impl MessageOptions {
    pub fn summary() -> Self {
        Self {
            summary_mode: true,
            include_raw_memory: false,
        }
    }
}

/// Projection of one record into model messages.
pub trait ToMessages {
    fn to_messages(&self, options: MessageOptions) -> Vec<Message>;
}

/// One entry in an agent run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepRecord {
    SystemPrompt(SystemPromptStep),
    Task(TaskStep),
    Planning(PlanningStep),
    Action(ActionStep),
}

impl StepRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SystemPrompt(_) => "system_prompt",
            Self::Task(_) => "task",
            Self::Planning(_) => "planning",
            Self::Action(_) => "action",
        }
    }

    pub fn as_action(&self) -> Option<&ActionStep> {
        match self {
            Self::Action(step) => Some(step),
            _ => None,
        }
    }
}

impl ToMessages for StepRecord {
    fn to_messages(&self, options: MessageOptions) -> Vec<Message> {
        match self {
            Self::SystemPrompt(step) => step.to_messages(options),
            Self::Task(step) => step.to_messages(options),
            Self::Planning(step) => step.to_messages(options),
            Self::Action(step) => step.to_messages(options),
        }
    }
}

impl From<SystemPromptStep> for StepRecord {
    fn from(step: SystemPromptStep) -> Self {
        Self::SystemPrompt(step)
    }
}

impl From<TaskStep> for StepRecord {
    fn from(step: TaskStep) -> Self {
        Self::Task(step)
    }
}

impl From<PlanningStep> for StepRecord {
    fn from(step: PlanningStep) -> Self {
        Self::Planning(step)
    }
}

impl From<ActionStep> for StepRecord {
    fn from(step: ActionStep) -> Self {
        Self::Action(step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPromptStep {
    pub system_prompt: String,
}

impl SystemPromptStep {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }
}

impl ToMessages for SystemPromptStep {
    fn to_messages(&self, options: MessageOptions) -> Vec<Message> {
        if options.summary_mode {
            return Vec::new();
        }
        vec![Message::text(MessageRole::System, self.system_prompt.trim())]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStep {
    pub task: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_images: Vec<Image>,
}

impl TaskStep {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            task_images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<Image>) -> Self {
        self.task_images = images;
        self
    }
}

impl ToMessages for TaskStep {
    fn to_messages(&self, _options: MessageOptions) -> Vec<Message> {
        let mut content = vec![ContentBlock::Text {
            text: format!("New task:\n{}", self.task),
        }];
        content.extend(
            self.task_images
                .iter()
                .map(|image| ContentBlock::Image {
                    image: image.clone(),
                }),
        );
        vec![Message::new(MessageRole::User, content)]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningStep {
    pub facts: String,
    pub plan: String,
}

impl PlanningStep {
    pub fn new(facts: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            facts: facts.into(),
            plan: plan.into(),
        }
    }
}

impl ToMessages for PlanningStep {
    fn to_messages(&self, options: MessageOptions) -> Vec<Message> {
        let mut messages = vec![Message::text(
            MessageRole::Assistant,
            format!("[FACTS LIST]:\n{}", self.facts.trim()),
        )];
        if !options.summary_mode {
            messages.push(Message::text(
                MessageRole::Assistant,
                format!("[PLAN]:\n{}", self.plan.trim()),
            ));
        }
        messages
    }
}

/// Record of one agent turn.
///
/// Filled in progressively while the turn runs (model output, tool calls,
/// then an observation or an error, then timing) and frozen once appended
/// to a [`MemoryStore`](crate::core::memory::MemoryStore).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    /// Debug snapshot of the context the model saw for this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_memory: Option<Vec<Message>>,
    #[serde(default, with = "tool_call_list")]
    pub tool_calls: Option<Vec<ToolCall>>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    #[serde(rename = "step")]
    pub step_number: Option<u32>,
    pub error: Option<AgentError>,
    pub duration: Option<f64>,
    pub llm_output: Option<String>,
    pub observations: Option<String>,
    #[serde(default)]
    pub observations_images: Vec<Image>,
    pub action_output: Option<WireValue>,
}

impl ActionStep {
    pub fn new(step_number: u32, start_time: f64) -> Self {
        Self {
            step_number: Some(step_number),
            start_time: Some(start_time),
            ..Self::default()
        }
    }

    pub fn record_model_output(&mut self, llm_output: impl Into<String>) {
        self.llm_output = Some(llm_output.into());
    }

    pub fn record_tool_calls(&mut self, tool_calls: Vec<ToolCall>) {
        self.tool_calls = Some(tool_calls);
    }

    pub fn record_memory_snapshot(&mut self, messages: Vec<Message>) {
        self.agent_memory = Some(messages);
    }

    pub fn record_observation(&mut self, observations: impl Into<String>, output: Option<WireValue>) {
        self.observations = Some(observations.into());
        self.action_output = output;
    }

    pub fn record_images(&mut self, images: Vec<Image>) {
        self.observations_images = images;
    }

    pub fn record_error(&mut self, error: AgentError) {
        self.error = Some(error);
    }

    /// Stamp the end time; duration is derived from the start time.
    pub fn finish(&mut self, end_time: f64) {
        self.end_time = Some(end_time);
        self.duration = self.start_time.map(|start| (end_time - start).max(0.0));
    }

    fn first_call_id(&self) -> Option<&str> {
        self.tool_calls
            .as_ref()
            .and_then(|calls| calls.first())
            .map(|call| call.id.as_str())
    }
}

impl ToMessages for ActionStep {
    fn to_messages(&self, options: MessageOptions) -> Vec<Message> {
        let mut messages = Vec::new();

        if options.include_raw_memory
            && let Some(snapshot) = &self.agent_memory
        {
            let text = serde_json::to_string(snapshot).unwrap_or_default();
            messages.push(Message::text(MessageRole::System, text));
        }

        if !options.summary_mode
            && let Some(llm_output) = &self.llm_output
        {
            messages.push(Message::text(MessageRole::Assistant, llm_output.trim()));
        }

        if let Some(calls) = &self.tool_calls {
            let listed: Vec<_> = calls.iter().map(ToolCall::to_json).collect();
            let text = serde_json::to_string(&listed).unwrap_or_default();
            messages.push(Message::text(MessageRole::Assistant, text));
        }

        match (&self.error, self.first_call_id()) {
            (Some(error), None) => {
                messages.push(Message::text(MessageRole::Assistant, error.feedback()));
            }
            (Some(error), Some(call_id)) => {
                messages.push(Message::text(
                    MessageRole::ToolResponse,
                    format!("Call id: {call_id}\n{}", error.feedback()),
                ));
            }
            (None, Some(call_id)) => {
                if let Some(observations) = &self.observations {
                    messages.push(Message::text(
                        MessageRole::ToolResponse,
                        format!("Call id: {call_id}\nObservation:\n{observations}"),
                    ));
                }
            }
            (None, None) => {}
        }

        if !self.observations_images.is_empty() {
            let mut content = vec![ContentBlock::Text {
                text: "Here are the observed images:".to_string(),
            }];
            content.extend(
                self.observations_images
                    .iter()
                    .map(|image| ContentBlock::Image {
                        image: image.clone(),
                    }),
            );
            messages.push(Message::new(MessageRole::User, content));
        }

        messages
    }
}

/// Tool calls persist in their function-call JSON shape.
mod tool_call_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
    use serde_json::Value;

    use crate::core::types::ToolCall;

    pub fn serialize<S: Serializer>(
        calls: &Option<Vec<ToolCall>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        calls
            .as_ref()
            .map(|calls| calls.iter().map(ToolCall::to_json).collect::<Vec<_>>())
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<ToolCall>>, D::Error> {
        let Some(values) = Option::<Vec<Value>>::deserialize(deserializer)? else {
            return Ok(None);
        };
        values
            .iter()
            .map(|value| {
                ToolCall::from_json(value)
                    .ok_or_else(|| de::Error::custom(format!("malformed tool call {value}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action_with_call() -> ActionStep {
        let mut step = ActionStep::new(1, 100.0);
        step.record_model_output("  Thought: add numbers  ");
        step.record_tool_calls(vec![ToolCall::new(
            "python_interpreter",
            json!("x = 1 + 1"),
            "call_1",
        )]);
        step
    }

    #[test]
    fn system_prompt_hidden_in_summary_mode() {
        let step = SystemPromptStep::new("  You are helpful.\n");
        let full = step.to_messages(MessageOptions::default());
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].role, MessageRole::System);
        assert_eq!(full[0].text_content(), "You are helpful.");
        assert!(step.to_messages(MessageOptions::summary()).is_empty());
    }

    #[test]
    fn task_combines_text_and_images() {
        let step = TaskStep::new("Describe the image").with_images(vec![Image::png(vec![1, 2])]);
        let messages = step.to_messages(MessageOptions::summary());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].text_content(), "New task:\nDescribe the image");
        assert_eq!(messages[0].images().count(), 1);
    }

    #[test]
    fn planning_drops_plan_in_summary_mode() {
        let step = PlanningStep::new("facts ", "1. do it");
        let full = step.to_messages(MessageOptions::default());
        assert_eq!(full.len(), 2);
        assert_eq!(full[0].text_content(), "[FACTS LIST]:\nfacts");
        assert_eq!(full[1].text_content(), "[PLAN]:\n1. do it");
        assert_eq!(step.to_messages(MessageOptions::summary()).len(), 1);
    }

    /// With a tool call, the error goes back as a tool response for that call.
    #[test]
    fn error_with_tool_call_is_tool_response() {
        let mut step = action_with_call();
        step.record_error(AgentError::execution("Code execution failed:", "ZeroDivisionError"));

        let messages = step.to_messages(MessageOptions::default());
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::Assistant,
                MessageRole::Assistant,
                MessageRole::ToolResponse
            ]
        );
        let last = messages[2].text_content();
        assert!(last.starts_with("Call id: call_1\nError:\n"));
        assert!(last.contains("ZeroDivisionError"));
    }

    #[test]
    fn error_without_tool_call_is_assistant() {
        let mut step = ActionStep::new(2, 0.0);
        step.record_error(AgentError::parsing("no code blob found"));
        let messages = step.to_messages(MessageOptions::default());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert!(messages[0].text_content().contains("no code blob found"));
    }

    #[test]
    fn observation_and_images_are_both_emitted() {
        let mut step = action_with_call();
        step.record_observation("2", Some(WireValue::from(2_i64)));
        step.record_images(vec![Image::png(vec![9])]);

        let messages = step.to_messages(MessageOptions::summary());
        assert_eq!(messages.len(), 3, "tool calls, observation, images");
        assert_eq!(messages[1].role, MessageRole::ToolResponse);
        assert_eq!(
            messages[1].text_content(),
            "Call id: call_1\nObservation:\n2"
        );
        assert_eq!(messages[2].role, MessageRole::User);
        assert_eq!(messages[2].images().count(), 1);
    }

    #[test]
    fn raw_memory_block_comes_first_when_requested() {
        let mut step = action_with_call();
        step.record_memory_snapshot(vec![Message::text(MessageRole::User, "earlier")]);

        let without = step.to_messages(MessageOptions::default());
        assert_ne!(without[0].role, MessageRole::System);

        let with = step.to_messages(MessageOptions {
            summary_mode: false,
            include_raw_memory: true,
        });
        assert_eq!(with.len(), without.len() + 1);
        assert_eq!(with[0].role, MessageRole::System);
        assert!(with[0].text_content().contains("earlier"));
    }

    #[test]
    fn finish_derives_duration() {
        let mut step = ActionStep::new(1, 10.0);
        step.finish(12.5);
        assert_eq!(step.end_time, Some(12.5));
        assert_eq!(step.duration, Some(2.5));
    }

    /// Persisted action steps use `step` and the function-call tool shape.
    #[test]
    fn action_step_serialized_form() {
        let mut step = action_with_call();
        step.record_observation("2", Some(WireValue::from(2_i64)));
        step.finish(101.0);
        let record = StepRecord::from(step.clone());

        let value = serde_json::to_value(&record).expect("encode");
        assert_eq!(value["kind"], "action");
        assert_eq!(value["step"], 1);
        assert_eq!(value["tool_calls"][0]["function"]["name"], "python_interpreter");
        assert_eq!(value["action_output"], json!({"type": "int", "value": 2}));
        assert!(value.get("agent_memory").is_none());

        let back: StepRecord = serde_json::from_value(value).expect("decode");
        assert_eq!(back, record);
    }
}
