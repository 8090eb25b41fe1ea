//! Isolation backends that host the sandbox driver process.
//!
//! A backend only has to start the driver with piped stdio and clean up after
//! it. Everything else (framing, state, artifacts) goes through the session
//! I/O directory and the driver's stdin/stdout, identically for every backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{BackendKind, DockerConfig, SandboxConfig};
use crate::io::process::run_command_with_timeout;
use crate::io::state_channel::{ARTIFACT_DIR, STATE_DIR};

const DRIVER_SOURCE: &str = include_str!("../../sandbox/driver.py");
const DOCKERFILE_TEMPLATE: &str = include_str!("../../sandbox/Dockerfile.jinja");

/// Driver script name inside the session I/O directory.
pub const DRIVER_FILE: &str = "__sandbox_driver__.py";

/// Where the I/O directory is mounted inside a container.
pub const CONTAINER_IO_DIR: &str = "/sandbox-io";

const CLI_OUTPUT_LIMIT: usize = 64 * 1024;

/// Everything a backend needs to start one session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Unique session name; doubles as the container name.
    pub session: String,
    /// Host directory shared with the sandbox.
    pub io_dir: PathBuf,
    pub host: String,
    /// Port to publish from a container; `None` publishes nothing.
    pub port: Option<u16>,
    pub startup_timeout: Duration,
}

pub trait SandboxBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Check that the backend can run sessions at all (daemon reachable,
    /// image present). Called once before the first launch.
    fn prepare(&self, spec: &LaunchSpec) -> Result<()>;

    /// Spawn the driver with stdin, stdout and stderr piped.
    fn launch(&self, spec: &LaunchSpec) -> Result<Child>;

    /// Release anything that outlives the driver process.
    fn teardown(&self, spec: &LaunchSpec) -> Result<()>;
}

/// Backend selected by `config.backend`.
pub fn from_config(config: &SandboxConfig) -> Box<dyn SandboxBackend> {
    match config.backend {
        BackendKind::Local => Box::new(LocalProcessBackend {
            python: config.python.clone(),
        }),
        BackendKind::Docker => Box::new(DockerBackend {
            docker: config.docker.clone(),
            build_timeout: config.install_timeout(),
        }),
    }
}

/// Lay out a fresh I/O directory: driver script plus state and artifact dirs.
pub fn stage_io_dir(io_dir: &Path) -> Result<()> {
    for dir in [STATE_DIR, ARTIFACT_DIR] {
        let path = io_dir.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;
    }
    let driver = io_dir.join(DRIVER_FILE);
    fs::write(&driver, DRIVER_SOURCE).with_context(|| format!("write {}", driver.display()))?;
    Ok(())
}

fn piped(cmd: &mut Command) -> &mut Command {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
}

/// Driver run by a host interpreter, confined to its I/O directory.
#[derive(Debug, Clone)]
pub struct LocalProcessBackend {
    pub python: String,
}

impl SandboxBackend for LocalProcessBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn prepare(&self, _spec: &LaunchSpec) -> Result<()> {
        Ok(())
    }

    #[instrument(skip_all, fields(session = %spec.session))]
    fn launch(&self, spec: &LaunchSpec) -> Result<Child> {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-u")
            .arg(spec.io_dir.join(DRIVER_FILE))
            .arg("--io-dir")
            .arg(&spec.io_dir)
            .current_dir(&spec.io_dir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("MPLBACKEND", "Agg");
        debug!(python = %self.python, "launching local driver");
        piped(&mut cmd)
            .spawn()
            .with_context(|| format!("spawn python interpreter `{}`", self.python))
    }

    fn teardown(&self, _spec: &LaunchSpec) -> Result<()> {
        Ok(())
    }
}

/// Driver run in a throwaway container with the I/O directory bind-mounted.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    pub docker: DockerConfig,
    pub build_timeout: Duration,
}

impl DockerBackend {
    fn command(&self) -> Command {
        Command::new(&self.docker.binary)
    }

    /// Arguments of the `docker run` that starts the driver.
    fn run_args(&self, spec: &LaunchSpec, io_dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["run", "--rm", "-i", "--name", spec.session.as_str()]
            .map(String::from)
            .to_vec();
        args.extend([
            "-v".to_string(),
            format!("{}:{CONTAINER_IO_DIR}", io_dir.display()),
            "-w".to_string(),
            CONTAINER_IO_DIR.to_string(),
        ]);
        if let Some(port) = spec.port {
            args.extend(["-p".to_string(), format!("{}:{port}:{port}", spec.host)]);
        }
        args.extend(
            ["-e", "MPLBACKEND=Agg", "-e", "PYTHONDONTWRITEBYTECODE=1"].map(String::from),
        );
        args.push(self.docker.image.clone());
        args.extend([
            "python3".to_string(),
            "-u".to_string(),
            format!("{CONTAINER_IO_DIR}/{DRIVER_FILE}"),
            "--io-dir".to_string(),
            CONTAINER_IO_DIR.to_string(),
        ]);
        args
    }

    fn image_exists(&self, timeout: Duration) -> Result<bool> {
        let mut cmd = self.command();
        cmd.args(["image", "inspect", "--format", "{{.Id}}", self.docker.image.as_str()]);
        let output = run_command_with_timeout(cmd, None, timeout, CLI_OUTPUT_LIMIT)?;
        Ok(output.success())
    }

    fn build_image(&self) -> Result<()> {
        let dockerfile = render_dockerfile(&self.docker.base_image)?;
        let mut cmd = self.command();
        cmd.args(["build", "-t", self.docker.image.as_str(), "-"]);
        info!(image = %self.docker.image, "building sandbox image");
        let output =
            run_command_with_timeout(cmd, Some(dockerfile.as_bytes()), self.build_timeout, CLI_OUTPUT_LIMIT)?;
        if !output.success() {
            bail!(
                "docker build of `{}` failed:\n{}",
                self.docker.image,
                output.combined_text("docker build")
            );
        }
        Ok(())
    }
}

impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip_all, fields(image = %self.docker.image))]
    fn prepare(&self, spec: &LaunchSpec) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["version", "--format", "{{.Server.Version}}"]);
        let output = run_command_with_timeout(cmd, None, spec.startup_timeout, CLI_OUTPUT_LIMIT)
            .context("run docker version")?;
        if !output.success() {
            bail!(
                "docker daemon is not reachable:\n{}",
                output.combined_text("docker version")
            );
        }
        debug!(
            server = %String::from_utf8_lossy(&output.stdout).trim(),
            "docker daemon reachable"
        );

        if self.docker.build && !self.image_exists(spec.startup_timeout)? {
            self.build_image()?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(session = %spec.session))]
    fn launch(&self, spec: &LaunchSpec) -> Result<Child> {
        let io_dir = fs::canonicalize(&spec.io_dir)
            .with_context(|| format!("resolve {}", spec.io_dir.display()))?;
        let mut cmd = self.command();
        cmd.args(self.run_args(spec, &io_dir));
        debug!(image = %self.docker.image, port = ?spec.port, "launching container driver");
        piped(&mut cmd)
            .spawn()
            .with_context(|| format!("spawn `{}`", self.docker.binary))
    }

    #[instrument(skip_all, fields(session = %spec.session))]
    fn teardown(&self, spec: &LaunchSpec) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["rm", "-f", spec.session.as_str()]);
        let output = run_command_with_timeout(cmd, None, spec.startup_timeout, CLI_OUTPUT_LIMIT)?;
        if !output.success() {
            let text = output.combined_text("docker rm");
            if !text.contains("No such container") {
                warn!(output = %text.trim(), "docker rm reported a failure");
            }
        }
        Ok(())
    }
}

fn render_dockerfile(base_image: &str) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("Dockerfile", DOCKERFILE_TEMPLATE)
        .context("load Dockerfile template")?;
    env.get_template("Dockerfile")
        .context("get Dockerfile template")?
        .render(context! {
            base_image => base_image,
            io_mount => CONTAINER_IO_DIR,
        })
        .context("render Dockerfile")
}
