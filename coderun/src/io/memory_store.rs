//! Persistence of a run's memory as pretty JSON.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::memory::MemoryStore;

/// Atomically write `memory` to `path` (pretty JSON, trailing newline).
pub fn write_memory(path: &Path, memory: &MemoryStore) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(memory).context("serialize memory")?;
    buf.push('\n');
    super::write_atomic(path, buf.as_bytes())?;
    debug!(path = %path.display(), steps = memory.len(), "wrote memory");
    Ok(())
}

pub fn load_memory(path: &Path) -> Result<MemoryStore> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse memory {}", path.display()))
}

/// Load `path`, or start an empty store when it does not exist yet.
pub fn load_memory_or_default(path: &Path) -> Result<MemoryStore> {
    if path.exists() {
        load_memory(path)
    } else {
        Ok(MemoryStore::new())
    }
}
