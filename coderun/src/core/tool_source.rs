//! Materialization of tool definitions as sandbox source code.
//!
//! Pure data transformation: each [`ToolDefinition`] becomes a class
//! definition plus an instantiation statement binding the tool's name in the
//! sandbox namespace. Free text (description, schema) is embedded only as
//! JSON-escaped string literals.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use jsonschema::Draft;
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::names::{is_identifier, is_reserved};
use crate::error::ExecutorError;

const TOOL_TEMPLATE: &str = include_str!("../../sandbox/tool.py.jinja");

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("tool.py", TOOL_TEMPLATE)
        .expect("tool template should be valid");
    env
});

/// A tool made callable inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Name bound in the sandbox namespace; must be an identifier.
    pub name: String,
    pub description: String,
    /// Input properties: `{arg: {"type": ..., "description": ...}}`.
    #[serde(default = "empty_object")]
    pub inputs: Value,
    #[serde(default = "default_output_type")]
    pub output_type: String,
    /// Source defining `def forward(self, ...)`, unindented.
    pub source: String,
}

fn empty_object() -> Value {
    json!({})
}

fn default_output_type() -> String {
    "any".to_string()
}

impl ToolDefinition {
    /// JSON Schema describing the tool's arguments object.
    pub fn arguments_schema(&self) -> Value {
        let required: Vec<&String> = self
            .inputs
            .as_object()
            .map(|props| {
                props
                    .iter()
                    .filter(|(_, spec)| spec.get("nullable") != Some(&Value::Bool(true)))
                    .map(|(name, _)| name)
                    .collect()
            })
            .unwrap_or_default();
        json!({
            "type": "object",
            "properties": self.inputs,
            "required": required,
        })
    }

    /// Schema violations of `arguments` against the tool's inputs.
    pub fn argument_errors(&self, arguments: &Value) -> Result<Vec<String>, ExecutorError> {
        let schema = self.arguments_schema();
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|err| ExecutorError::ToolSetup {
                log: format!("tool `{}` has an invalid input schema: {err}", self.name),
            })?;
        Ok(validator
            .iter_errors(arguments)
            .map(|err| err.to_string())
            .collect())
    }

    fn validate(&self) -> Result<(), ExecutorError> {
        if !is_identifier(&self.name) || is_reserved(&self.name) {
            return Err(ExecutorError::InvalidName {
                what: "tool name",
                value: self.name.clone(),
            });
        }
        if !self.inputs.is_object() {
            return Err(ExecutorError::ToolSetup {
                log: format!("tool `{}`: inputs must be a JSON object", self.name),
            });
        }
        self.argument_errors(&json!({}))?;
        if !self.source.contains("def forward(") {
            return Err(ExecutorError::ToolSetup {
                log: format!("tool `{}`: source must define `forward`", self.name),
            });
        }
        Ok(())
    }
}

/// Source text for one tool: class definition plus instantiation.
pub fn render_tool(tool: &ToolDefinition) -> Result<String, ExecutorError> {
    tool.validate()?;
    let literal = |text: &str| serde_json::to_string(text).unwrap_or_default();
    let template = TEMPLATES
        .get_template("tool.py")
        .map_err(|err| ExecutorError::ToolSetup {
            log: err.to_string(),
        })?;
    template
        .render(context! {
            class_name => format!("__SandboxTool_{}", tool.name),
            name => tool.name,
            name_literal => literal(&tool.name),
            description_literal => literal(&tool.description),
            inputs_literal => literal(&tool.inputs.to_string()),
            output_type_literal => literal(&tool.output_type),
            source => tool.source.trim_end(),
        })
        .map_err(|err| ExecutorError::ToolSetup {
            log: format!("render tool `{}`: {err}", tool.name),
        })
}

/// Bootstrap source for a tool set. Duplicate names are rejected.
pub fn render_bootstrap(tools: &[ToolDefinition]) -> Result<String, ExecutorError> {
    let mut seen = BTreeSet::new();
    let mut out = String::from("import json as __sandbox_json__\n\n");
    for tool in tools {
        if !seen.insert(tool.name.as_str()) {
            return Err(ExecutorError::ToolSetup {
                log: format!("duplicate tool name `{}`", tool.name),
            });
        }
        out.push_str(&render_tool(tool)?);
        out.push_str("\n\n");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adder() -> ToolDefinition {
        ToolDefinition {
            name: "add".to_string(),
            description: "Adds \"two\" numbers.\nReturns their sum.".to_string(),
            inputs: json!({
                "a": {"type": "integer", "description": "first"},
                "b": {"type": "integer", "description": "second"}
            }),
            output_type: "integer".to_string(),
            source: "def forward(self, a, b):\n    return a + b\n".to_string(),
        }
    }

    #[test]
    fn renders_class_and_instance() {
        let source = render_tool(&adder()).expect("render");
        assert!(source.starts_with("class __SandboxTool_add:\n"));
        assert!(source.contains("    name = \"add\"\n"));
        assert!(source.contains(r#"description = "Adds \"two\" numbers.\nReturns their sum.""#));
        assert!(source.contains("    def forward(self, a, b):\n        return a + b\n"));
        assert!(source.trim_end().ends_with("add = __SandboxTool_add()"));
    }

    #[test]
    fn bootstrap_rejects_duplicates() {
        let err = render_bootstrap(&[adder(), adder()]).unwrap_err();
        assert!(err.to_string().contains("duplicate tool name `add`"));
    }

    #[test]
    fn rejects_invalid_names() {
        let mut tool = adder();
        tool.name = "add; import os".to_string();
        assert!(matches!(
            render_tool(&tool),
            Err(ExecutorError::InvalidName { .. })
        ));
        tool.name = "final_answer".to_string();
        assert!(render_tool(&tool).is_err());
    }

    #[test]
    fn rejects_source_without_forward() {
        let mut tool = adder();
        tool.source = "x = 1".to_string();
        assert!(matches!(
            render_tool(&tool),
            Err(ExecutorError::ToolSetup { .. })
        ));
    }

    #[test]
    fn argument_validation_uses_inputs_schema() {
        let tool = adder();
        assert!(tool.argument_errors(&json!({"a": 1, "b": 2})).expect("schema").is_empty());
        let errors = tool.argument_errors(&json!({"a": "one"})).expect("schema");
        assert!(!errors.is_empty());
    }
}
