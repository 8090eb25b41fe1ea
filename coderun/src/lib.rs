//! Sandboxed code execution and turn memory for code-writing agents.
//!
//! The crate keeps a strict split between pure and effectful code:
//!
//! - **[`core`]**: Pure, deterministic logic (wire values, step records, memory
//!   projection, final-answer detection, tool source generation). No I/O.
//! - **[`io`]**: Side effects (child processes, framed pipes, the shared
//!   state/artifact directory, config and memory files).
//!
//! [`executor`] ties both together into a [`executor::SandboxExecutor`] session.

pub mod core;
pub mod error;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::core::memory::MemoryStore;
pub use crate::core::value::WireValue;
pub use crate::error::{AgentError, ExecutorError};
pub use crate::executor::{ExecutionOutput, KillSwitch, SandboxExecutor, SandboxOptions};
