//! Helpers shared by unit and integration tests.

use std::process::Command;
use std::time::Duration;

use crate::core::memory::MemoryStore;
use crate::core::steps::{ActionStep, PlanningStep, SystemPromptStep, TaskStep};
use crate::core::types::ToolCall;
use crate::error::AgentError;
use crate::io::config::SandboxConfig;
use crate::io::process::run_command_with_timeout;

/// Interpreter used by sandbox tests, overridable with `CODERUN_TEST_PYTHON`.
pub fn test_python() -> String {
    std::env::var("CODERUN_TEST_PYTHON").unwrap_or_else(|_| "python3".to_string())
}

/// True when the test interpreter can be started.
pub fn python_available() -> bool {
    let mut cmd = Command::new(test_python());
    cmd.arg("--version");
    run_command_with_timeout(cmd, None, Duration::from_secs(10), 1024)
        .map(|output| output.success())
        .unwrap_or(false)
}

/// Local-backend config with budgets small enough for tests.
pub fn local_config() -> SandboxConfig {
    SandboxConfig {
        python: test_python(),
        timeout_secs: 10,
        timeout_grace_secs: 5,
        startup_timeout_secs: 30,
        ..SandboxConfig::default()
    }
}

/// A tool call as the code agent records it.
pub fn code_call(id: &str, code: &str) -> ToolCall {
    ToolCall::new("python_interpreter", serde_json::json!(code), id)
}

/// Finished action step whose code raised.
pub fn failed_action(step_number: u32, call_id: &str) -> ActionStep {
    let mut action = ActionStep::new(step_number, 100.0);
    action.record_model_output("Thought: divide.\nCode:\n```py\n1 / 0\n```");
    action.record_tool_calls(vec![code_call(call_id, "1 / 0")]);
    action.record_error(AgentError::execution(
        "Code execution failed:",
        "ZeroDivisionError: division by zero",
    ));
    action.finish(101.5);
    action
}

/// Memory holding one record of every kind.
pub fn sample_memory() -> MemoryStore {
    let mut memory = MemoryStore::new();
    memory.append(SystemPromptStep::new("You solve tasks with code."));
    memory.append(TaskStep::new("What is 2 + 3?"));
    memory.append(PlanningStep::new("- two numbers", "1. add them"));
    memory.append(failed_action(1, "call_1"));

    let mut action = ActionStep::new(2, 102.0);
    action.record_model_output("Thought: add.");
    action.record_tool_calls(vec![code_call("call_2", "final_answer(2 + 3)")]);
    action.record_observation("Last output from code snippet:\n5", Some(5_i64.into()));
    action.finish(102.25);
    memory.append(action);
    memory
}
