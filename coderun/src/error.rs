//! Error kinds carried through a run.
//!
//! Two layers:
//!
//! - [`AgentError`]: what the owning loop records on an action step and feeds
//!   back to the model. Serializable so it survives memory persistence.
//! - [`ExecutorError`]: typed failures of the sandbox executor. Every variant
//!   converts into [`AgentError::Execution`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reported failure of one agent turn.
///
/// All kinds except [`AgentError::StepLimitExceeded`] are recoverable: the
/// loop logs them, stores them on the action step and lets the model retry.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentError {
    /// Model output did not match the expected action syntax.
    #[error("{message}")]
    Parsing { message: String },
    /// Sandboxed code failed; `diagnostics` holds the captured output.
    #[error("{message}{}", diagnostics_suffix(.diagnostics))]
    Execution {
        message: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        diagnostics: String,
    },
    /// Turn budget exhausted. Terminal for the run.
    #[error("{message}")]
    StepLimitExceeded { message: String },
    /// The model call itself failed.
    #[error("{message}")]
    Generation { message: String },
}

fn diagnostics_suffix(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!("\n{diagnostics}")
    }
}

impl AgentError {
    pub fn parsing(message: impl Into<String>) -> Self {
        Self::Parsing {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn step_limit(max_steps: u32) -> Self {
        Self::StepLimitExceeded {
            message: format!("Reached max steps ({max_steps})."),
        }
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    /// Stable name of the kind, as used in the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parsing { .. } => "parsing",
            Self::Execution { .. } => "execution",
            Self::StepLimitExceeded { .. } => "step_limit_exceeded",
            Self::Generation { .. } => "generation",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Parsing { message }
            | Self::Execution { message, .. }
            | Self::StepLimitExceeded { message }
            | Self::Generation { message } => message,
        }
    }

    /// Only the step limit ends a run; everything else is fed back to the model.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StepLimitExceeded { .. })
    }

    /// Retry message shown to the model on the turn after the failure.
    pub fn feedback(&self) -> String {
        format!(
            "Error:\n{self}\nNow let's retry: take care not to repeat previous errors! \
             If you have retried several times, try a completely different approach.\n"
        )
    }
}

/// Failure of a sandbox executor operation.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The isolation backend could not be reached, started, or has exited.
    #[error("sandbox environment unavailable: {0}")]
    EnvironmentUnavailable(String),
    #[error("failed to install package `{package}`:\n{log}")]
    DependencyInstall { package: String, log: String },
    #[error("tool bootstrap failed:\n{log}")]
    ToolSetup { log: String },
    /// The snippet raised; `log` is the captured output followed by the traceback.
    #[error("code execution failed:\n{log}")]
    CodeExecution { log: String },
    #[error("code execution timed out after {}s", .timeout.as_secs())]
    Timeout { timeout: Duration, log: String },
    /// The final-answer artifact was missing, incomplete, or not a valid wire value.
    #[error("could not decode sandbox result: {0}")]
    ResultDecode(String),
    #[error("name `{name}` is not defined in the sandbox")]
    UndefinedVariable { name: String },
    #[error("invalid {what} `{value}`")]
    InvalidName { what: &'static str, value: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl ExecutorError {
    /// Per-call failures the owning loop should record and continue past.
    ///
    /// Construction failures and a dead environment are not recoverable: the
    /// executor has to be rebuilt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CodeExecution { .. }
                | Self::Timeout { .. }
                | Self::ResultDecode(_)
                | Self::UndefinedVariable { .. }
                | Self::InvalidName { .. }
        )
    }

    /// Captured sandbox text attached to the failure, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::DependencyInstall { log, .. }
            | Self::ToolSetup { log }
            | Self::CodeExecution { log }
            | Self::Timeout { log, .. } => Some(log),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<&ExecutorError> for AgentError {
    fn from(err: &ExecutorError) -> Self {
        match err {
            ExecutorError::CodeExecution { log } => {
                AgentError::execution("Code execution failed:", log.clone())
            }
            ExecutorError::Timeout { log, .. } => AgentError::execution(err.to_string(), log.clone()),
            _ => AgentError::execution(format!("{err:#}"), String::new()),
        }
    }
}

impl From<ExecutorError> for AgentError {
    fn from(err: ExecutorError) -> Self {
        AgentError::from(&err)
    }
}
