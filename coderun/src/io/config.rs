//! Sandbox configuration, usually stored as `coderun.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Isolation backend used to host the sandbox interpreter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Child interpreter process on the host.
    #[default]
    Local,
    /// Interpreter inside a throwaway container.
    Docker,
}

/// Sandbox configuration (TOML).
///
/// Missing fields default to values suitable for local development.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: BackendKind,

    /// Interpreter command for the local backend.
    pub python: String,

    /// Bind address for `port`.
    pub host: String,
    /// Container port published on `host`. Unset by default: the driver talks
    /// over stdio, so a port is only needed for services started by user code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Per-call execution budget in seconds, enforced inside the sandbox.
    pub timeout_secs: u64,

    /// Extra time the host waits past `timeout_secs` before killing the session.
    pub timeout_grace_secs: u64,

    /// Budget for the sandbox to come up and report ready.
    pub startup_timeout_secs: u64,

    /// Budget for a single package installation.
    pub install_timeout_secs: u64,

    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker CLI binary.
    pub binary: String,
    pub image: String,
    /// Build `image` from the bundled Dockerfile before the first run.
    pub build: bool,
    /// `FROM` line of the bundled Dockerfile.
    pub base_image: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            image: "coderun-sandbox:latest".to_string(),
            build: true,
            base_image: "python:3.12-slim".to_string(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            python: "python3".to_string(),
            host: "127.0.0.1".to_string(),
            port: None,
            timeout_secs: 30,
            timeout_grace_secs: 5,
            startup_timeout_secs: 60,
            install_timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
            docker: DockerConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        if self.startup_timeout_secs == 0 {
            return Err(anyhow!("startup_timeout_secs must be > 0"));
        }
        if self.install_timeout_secs == 0 {
            return Err(anyhow!("install_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.python.trim().is_empty() {
            return Err(anyhow!("python must be a non-empty command"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host must be non-empty"));
        }
        if self.backend == BackendKind::Docker {
            if self.docker.binary.trim().is_empty() {
                return Err(anyhow!("docker.binary must be non-empty"));
            }
            if self.docker.image.trim().is_empty() {
                return Err(anyhow!("docker.image must be non-empty"));
            }
            if self.docker.build && self.docker.base_image.trim().is_empty() {
                return Err(anyhow!("docker.base_image must be non-empty when docker.build is set"));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Longest the host waits for one response before giving up on the session.
    pub fn host_deadline(&self, timeout: Duration) -> Duration {
        timeout + Duration::from_secs(self.timeout_grace_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SandboxConfig::default()`.
pub fn load_config(path: &Path) -> Result<SandboxConfig> {
    if !path.exists() {
        let cfg = SandboxConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SandboxConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SandboxConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SandboxConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("coderun.toml");
        let cfg = SandboxConfig {
            backend: BackendKind::Docker,
            port: Some(9999),
            ..SandboxConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("coderun.toml");
        fs::write(&path, "timeout_secs = 7\n[docker]\nbuild = false\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.timeout_secs, 7);
        assert!(!cfg.docker.build);
        assert_eq!(cfg.docker.image, DockerConfig::default().image);
        assert_eq!(cfg.python, "python3");
    }

    #[test]
    fn rejects_zero_timeout() {
        let cfg = SandboxConfig {
            timeout_secs: 0,
            ..SandboxConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn host_deadline_adds_grace() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.host_deadline(Duration::from_secs(2)), Duration::from_secs(7));
    }
}
