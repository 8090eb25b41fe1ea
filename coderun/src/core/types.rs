//! Message types shared by step records and the memory projection.
//!
//! These are the model-facing shapes: role-tagged messages made of text and
//! image blocks, plus the tool-call record the model emits. They carry no
//! behavior beyond construction helpers.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::value::Image;

/// Role of a message in the projected conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    ToolCall,
    ToolResponse,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolCall => "tool-call",
            Self::ToolResponse => "tool-response",
        }
    }
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { image: Image },
}

/// A role-tagged message as sent to a model client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    /// Single text block message.
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentBlock::Text { text: text.into() }])
    }

    /// Concatenated text of all text blocks.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::Image { image } => Some(image),
            ContentBlock::Text { .. } => None,
        })
    }
}

/// A tool invocation emitted by the model.
///
/// `id` is unique within its step and correlates the call with the
/// tool-response message carrying its result or error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
    pub id: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments,
            id: id.into(),
        }
    }

    /// Function-call JSON object as model APIs expect it.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments,
            },
        })
    }

    /// Inverse of [`ToolCall::to_json`], used when loading persisted memory.
    pub fn from_json(value: &Value) -> Option<Self> {
        let id = value.get("id")?.as_str()?;
        let function = value.get("function")?;
        let name = function.get("name")?.as_str()?;
        let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);
        Some(Self::new(name, arguments, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_use_kebab_case() {
        let encoded = serde_json::to_string(&MessageRole::ToolResponse).expect("encode");
        assert_eq!(encoded, "\"tool-response\"");
        assert_eq!(MessageRole::ToolResponse.as_str(), "tool-response");
    }

    #[test]
    fn tool_call_json_shape() {
        let call = ToolCall::new("python_interpreter", json!({"code": "1 + 1"}), "call_0");
        let value = call.to_json();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "python_interpreter");
        assert_eq!(ToolCall::from_json(&value), Some(call));
    }

    #[test]
    fn text_content_skips_images() {
        let message = Message::new(
            MessageRole::User,
            vec![
                ContentBlock::Text {
                    text: "look: ".to_string(),
                },
                ContentBlock::Image {
                    image: Image::png(vec![1]),
                },
                ContentBlock::Text {
                    text: "done".to_string(),
                },
            ],
        );
        assert_eq!(message.text_content(), "look: done");
        assert_eq!(message.images().count(), 1);
    }
}
