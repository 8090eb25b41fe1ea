//! Deterministic, pure logic shared by the executor and the run history.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod final_answer;
pub mod memory;
pub mod names;
pub mod output;
pub mod steps;
pub mod tool_source;
pub mod types;
pub mod value;
