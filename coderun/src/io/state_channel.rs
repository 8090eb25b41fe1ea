//! File-based value transfer across the sandbox boundary.
//!
//! Both directions go through the session I/O directory, which the sandbox
//! sees as its working directory (local backend) or a bind mount (docker):
//!
//! - `state/<id>.json`: a map of variables written by the host. A generated
//!   loader call decodes it into the sandbox namespace.
//! - `artifacts/<id>.json`: an encoded value written by the driver. The
//!   response frame carries its length and SHA-256, checked here before
//!   decoding.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::names::{is_identifier, is_reserved};
use crate::core::value::WireValue;
use crate::error::ExecutorError;
use crate::io::protocol::ArtifactRef;
use crate::io::write_atomic;

pub const STATE_DIR: &str = "state";
pub const ARTIFACT_DIR: &str = "artifacts";

/// Check a variable name before it reaches generated code or the namespace.
pub fn validate_variable_name(name: &str) -> Result<(), ExecutorError> {
    if is_identifier(name) && !is_reserved(name) {
        Ok(())
    } else {
        Err(ExecutorError::InvalidName {
            what: "variable name",
            value: name.to_string(),
        })
    }
}

/// Write `variables` as a state file and return its path relative to `io_dir`.
pub fn write_state(
    io_dir: &Path,
    request_id: u64,
    variables: &BTreeMap<String, WireValue>,
) -> Result<String, ExecutorError> {
    for name in variables.keys() {
        validate_variable_name(name)?;
    }
    let relative = format!("{STATE_DIR}/{request_id}.json");
    let body = serde_json::to_vec(variables).context("encode state")?;
    write_atomic(&io_dir.join(&relative), &body)?;
    debug!(path = %relative, count = variables.len(), "wrote state file");
    Ok(relative)
}

/// Sandbox statement that loads a state file into the namespace.
pub fn loader_snippet(relative_path: &str) -> String {
    let literal = serde_json::to_string(relative_path).unwrap_or_default();
    format!("__sandbox_load_state__({literal})\n")
}

/// Load and verify a final-answer artifact.
pub fn read_artifact(io_dir: &Path, artifact: &ArtifactRef) -> Result<WireValue, ExecutorError> {
    let path = artifact_path(io_dir, &artifact.path)?;
    let body = fs::read(&path)
        .map_err(|e| ExecutorError::ResultDecode(format!("read {}: {e}", artifact.path)))?;

    if body.len() as u64 != artifact.bytes {
        return Err(ExecutorError::ResultDecode(format!(
            "artifact {} has {} bytes, expected {}",
            artifact.path,
            body.len(),
            artifact.bytes
        )));
    }
    let digest = hex::encode(Sha256::digest(&body));
    if !digest.eq_ignore_ascii_case(&artifact.sha256) {
        return Err(ExecutorError::ResultDecode(format!(
            "artifact {} digest mismatch",
            artifact.path
        )));
    }

    let value = serde_json::from_slice(&body)
        .map_err(|e| ExecutorError::ResultDecode(format!("decode {}: {e}", artifact.path)))?;
    if let Err(e) = fs::remove_file(&path) {
        warn!(err = %e, path = %path.display(), "failed to remove consumed artifact");
    }
    Ok(value)
}

/// Resolve an artifact path reported by the driver, refusing anything that
/// leaves the artifact directory.
fn artifact_path(io_dir: &Path, relative: &str) -> Result<PathBuf, ExecutorError> {
    let rel = Path::new(relative);
    let mut components = rel.components();
    let inside = matches!(components.next(), Some(Component::Normal(dir)) if dir == ARTIFACT_DIR)
        && matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if !inside {
        return Err(ExecutorError::ResultDecode(format!(
            "artifact path `{relative}` is outside {ARTIFACT_DIR}/"
        )));
    }
    Ok(io_dir.join(rel))
}

/// Delete every file in `dir` under `io_dir`, returning how many went.
///
/// Used before each call so artifacts of abandoned (timed-out) requests and
/// already-loaded state files can never be picked up later.
pub fn clear_dir(io_dir: &Path, dir: &str) -> anyhow::Result<usize> {
    let path = io_dir.join(dir);
    let entries = match fs::read_dir(&path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("list {}", path.display())),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("list {}", path.display()))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            fs::remove_file(entry.path())
                .with_context(|| format!("remove {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_artifact(io_dir: &Path, id: u64, body: &[u8]) -> ArtifactRef {
        let path = format!("{ARTIFACT_DIR}/{id}.json");
        write_atomic(&io_dir.join(&path), body).expect("write artifact");
        ArtifactRef {
            path,
            bytes: body.len() as u64,
            sha256: hex::encode(Sha256::digest(body)),
        }
    }

    #[test]
    fn state_file_holds_tagged_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut vars = BTreeMap::new();
        vars.insert("a".to_string(), WireValue::from(7_i64));
        let rel = write_state(temp.path(), 4, &vars).expect("write");
        assert_eq!(rel, "state/4.json");

        let raw = fs::read_to_string(temp.path().join(&rel)).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value, serde_json::json!({"a": {"type": "int", "value": 7}}));
    }

    #[test]
    fn state_rejects_bad_names_before_writing() {
        let temp = tempfile::tempdir().expect("tempdir");
        for name in ["1abc", "a b", "__sandbox_ns__", "final_answer", "class"] {
            let mut vars = BTreeMap::new();
            vars.insert(name.to_string(), WireValue::None);
            assert!(
                matches!(
                    write_state(temp.path(), 1, &vars),
                    Err(ExecutorError::InvalidName { .. })
                ),
                "{name} should be rejected"
            );
        }
        assert!(!temp.path().join(STATE_DIR).exists());
    }

    #[test]
    fn loader_quotes_path() {
        assert_eq!(
            loader_snippet("state/1.json"),
            "__sandbox_load_state__(\"state/1.json\")\n"
        );
    }

    #[test]
    fn verified_artifact_decodes_and_is_consumed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = write_artifact(temp.path(), 9, br#"{"type":"int","value":5}"#);
        let value = read_artifact(temp.path(), &artifact).expect("read");
        assert_eq!(value, WireValue::from(5_i64));
        assert!(!temp.path().join(&artifact.path).exists());
    }

    #[test]
    fn length_or_digest_mismatch_is_decode_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut artifact = write_artifact(temp.path(), 1, br#"{"type":"none"}"#);
        artifact.bytes += 1;
        assert!(matches!(
            read_artifact(temp.path(), &artifact),
            Err(ExecutorError::ResultDecode(_))
        ));

        let mut artifact = write_artifact(temp.path(), 2, br#"{"type":"none"}"#);
        artifact.sha256 = "ab".repeat(32);
        assert!(matches!(
            read_artifact(temp.path(), &artifact),
            Err(ExecutorError::ResultDecode(_))
        ));
    }

    #[test]
    fn unknown_tag_is_decode_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = write_artifact(temp.path(), 3, br#"{"type":"pickle","value":"x"}"#);
        assert!(matches!(
            read_artifact(temp.path(), &artifact),
            Err(ExecutorError::ResultDecode(_))
        ));
    }

    #[test]
    fn artifact_path_must_stay_inside_artifact_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        for path in ["../secret.json", "state/1.json", "artifacts/../x.json", "/etc/passwd"] {
            let artifact = ArtifactRef {
                path: path.to_string(),
                bytes: 0,
                sha256: String::new(),
            };
            assert!(
                read_artifact(temp.path(), &artifact).is_err(),
                "{path} should be refused"
            );
        }
    }

    #[test]
    fn clear_dir_removes_stale_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(clear_dir(temp.path(), ARTIFACT_DIR).expect("missing dir"), 0);
        write_artifact(temp.path(), 1, b"{}");
        write_artifact(temp.path(), 2, b"{}");
        assert_eq!(clear_dir(temp.path(), ARTIFACT_DIR).expect("clear"), 2);
    }
}
