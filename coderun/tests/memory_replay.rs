//! Memory projection and persistence through the public API.

use coderun::core::steps::{ActionStep, MessageOptions, StepRecord, SystemPromptStep, TaskStep};
use coderun::core::types::{ContentBlock, MessageRole};
use coderun::core::value::Image;
use coderun::io::memory_store::{load_memory, write_memory};
use coderun::test_support::{code_call, failed_action, sample_memory};
use coderun::{AgentError, MemoryStore};

/// Verifies an action with a tool call and an error yields a tool-response
/// message carrying the call id and the retry feedback.
#[test]
fn failed_tool_call_projects_to_tool_response() {
    let mut memory = MemoryStore::new();
    memory.append(failed_action(3, "call_abc"));

    let messages = memory.to_messages(MessageOptions::default());
    let response = messages
        .iter()
        .find(|m| m.role == MessageRole::ToolResponse)
        .expect("tool response");
    let text = response.text_content();
    assert!(text.starts_with("Call id: call_abc\nError:\n"), "text: {text}");
    assert!(text.contains("ZeroDivisionError"));
    assert!(text.contains("Now let's retry"));
}

#[test]
fn error_without_tool_call_goes_to_assistant() {
    let mut action = ActionStep::new(1, 0.0);
    action.record_error(AgentError::parsing("no code block found"));
    action.finish(0.5);
    let mut memory = MemoryStore::new();
    memory.append(action);

    let messages = memory.to_messages(MessageOptions::default());
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::Assistant);
    assert!(messages[0].text_content().contains("no code block found"));
}

#[test]
fn projection_is_idempotent() {
    let memory = sample_memory();
    let first = memory.to_messages(MessageOptions::default());
    let second = memory.to_messages(MessageOptions::default());
    assert_eq!(first, second);
    assert_eq!(memory.len(), 5);
}

#[test]
fn summary_mode_drops_prompt_plan_and_model_text() {
    let memory = sample_memory();
    let full = memory.to_messages(MessageOptions::default());
    let summary = memory.to_messages(MessageOptions::summary());

    assert!(summary.len() < full.len());
    assert!(summary.iter().all(|m| m.role != MessageRole::System));
    assert!(summary.iter().any(|m| m.text_content().starts_with("[FACTS LIST]:\n")));
    assert!(!summary.iter().any(|m| m.text_content().starts_with("[PLAN]:\n")));
    assert!(!summary.iter().any(|m| m.text_content().starts_with("Thought:")));
}

#[test]
fn observation_and_images_follow_tool_call() {
    let mut action = ActionStep::new(1, 0.0);
    action.record_tool_calls(vec![code_call("call_9", "plot()")]);
    action.record_observation("Execution logs:\nplotted", None);
    action.record_images(vec![Image::png(vec![1, 2, 3])]);
    action.finish(1.0);
    let mut memory = MemoryStore::new();
    memory.append(action);

    let messages = memory.to_messages(MessageOptions::default());
    let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::Assistant,
            MessageRole::ToolResponse,
            MessageRole::User
        ]
    );
    assert_eq!(
        messages[1].text_content(),
        "Call id: call_9\nObservation:\nExecution logs:\nplotted"
    );
    assert!(matches!(
        messages[2].content.as_slice(),
        [ContentBlock::Text { .. }, ContentBlock::Image { .. }]
    ));
}

#[test]
fn replacing_system_prompt_keeps_history() {
    let mut memory = sample_memory();
    let tail: Vec<StepRecord> = memory.steps()[1..].to_vec();
    memory.append(SystemPromptStep::new("new rules"));
    memory.append(TaskStep::new("second task"));

    assert_eq!(memory.steps()[1..tail.len() + 1], tail[..]);
    assert_eq!(
        memory.system_prompt().map(|s| s.system_prompt.as_str()),
        Some("new rules")
    );
    assert_eq!(memory.len(), tail.len() + 2);
}

#[test]
fn persisted_memory_reloads_with_same_projection() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("runs/memory.json");
    let memory = sample_memory();

    write_memory(&path, &memory).expect("write");
    let loaded = load_memory(&path).expect("load");

    assert_eq!(loaded, memory);
    for options in [MessageOptions::default(), MessageOptions::summary()] {
        assert_eq!(loaded.to_messages(options), memory.to_messages(options));
    }
}

/// The persisted action shape uses function-call JSON for tool calls and a
/// typed error object.
#[test]
fn action_serialized_shape() {
    let memory = sample_memory();
    let list = memory.to_list();
    let action = &list[3];

    assert_eq!(action["kind"], "action");
    assert_eq!(action["step"], 1);
    assert_eq!(action["tool_calls"][0]["type"], "function");
    assert_eq!(action["tool_calls"][0]["id"], "call_1");
    assert_eq!(action["tool_calls"][0]["function"]["name"], "python_interpreter");
    assert_eq!(action["error"]["type"], "execution");
    assert_eq!(action["duration"], 1.5);
}
