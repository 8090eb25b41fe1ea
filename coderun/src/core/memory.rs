//! Ordered history of an agent run.
//!
//! The store is append-only with one exception: a system prompt step always
//! lives in slot 0 and appending a new one replaces it in place, leaving the
//! rest of the sequence untouched. Appended records are never handed out
//! mutably.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::core::steps::{MessageOptions, StepRecord, SystemPromptStep, ToMessages};
use crate::core::types::Message;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStore {
    steps: Vec<StepRecord>,
    /// Raw model responses, kept for audit only and never replayed.
    #[serde(default)]
    chat_messages: Vec<Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    ///
    /// A system prompt step goes to slot 0. When slot 0 already holds a system
    /// prompt it is replaced and the length is unchanged. Otherwise the prompt
    /// is inserted in front, which grows the store by one and shifts every
    /// existing record; a non-prompt record in slot 0 is never overwritten.
    pub fn append(&mut self, step: impl Into<StepRecord>) {
        let step = step.into();
        if let StepRecord::SystemPrompt(_) = step {
            match self.steps.first() {
                Some(StepRecord::SystemPrompt(_)) => {
                    debug!("replacing system prompt in slot 0");
                    self.steps[0] = step;
                }
                _ => self.steps.insert(0, step),
            }
            return;
        }
        debug!(kind = step.kind(), position = self.steps.len(), "appending step");
        self.steps.push(step);
    }

    /// Clear the step sequence for a run that restarts without prior context.
    pub fn reset(&mut self) {
        self.steps.clear();
    }

    pub fn log_chat_message(&mut self, message: Value) {
        self.chat_messages.push(message);
    }

    pub fn clear_chat_messages(&mut self) {
        self.chat_messages.clear();
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn chat_messages(&self) -> &[Value] {
        &self.chat_messages
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn system_prompt(&self) -> Option<&SystemPromptStep> {
        match self.steps.first() {
            Some(StepRecord::SystemPrompt(step)) => Some(step),
            _ => None,
        }
    }

    /// Project the history into model messages, record by record.
    pub fn to_messages(&self, options: MessageOptions) -> Vec<Message> {
        self.steps
            .iter()
            .flat_map(|step| step.to_messages(options))
            .collect()
    }

    /// One JSON object per record.
    pub fn to_list(&self) -> Vec<Value> {
        self.steps
            .iter()
            .map(|step| serde_json::to_value(step).unwrap_or(Value::Null))
            .collect()
    }

    /// Records without the per-step memory snapshots.
    pub fn succinct_logs(&self) -> Vec<Value> {
        self.to_list()
            .into_iter()
            .map(|mut value| {
                if let Value::Object(map) = &mut value {
                    map.remove("agent_memory");
                }
                value
            })
            .collect()
    }

    /// Records plus the raw model response log.
    pub fn extended_logs(&self) -> Value {
        json!({
            "steps": self.to_list(),
            "chat_messages": self.chat_messages,
        })
    }
}
