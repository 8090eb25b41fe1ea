//! Sandboxed code execution with a persistent namespace.
//!
//! One [`SandboxExecutor`] owns one session: a driver process started by an
//! isolation backend, the framed channel to it, and a host directory shared
//! with it for state files and result artifacts. Calls are sequential; each
//! blocks until the driver answers or the deadline passes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::{Child, ChildStdin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use tempfile::TempDir;
use tracing::{Span, debug, info, info_span, instrument, warn};

use crate::core::final_answer::parse_final_answer;
use crate::core::names::is_package_spec;
use crate::core::output::{extract_images, with_truncation_notice};
use crate::core::tool_source::{ToolDefinition, render_bootstrap};
use crate::core::value::{Image, WireValue};
use crate::error::ExecutorError;
use crate::io::backend::{self, LaunchSpec, SandboxBackend};
use crate::io::config::SandboxConfig;
use crate::io::process::{StderrTail, stop_child};
use crate::io::protocol::{
    DriverMessage, Request, RequestKind, Response, ResponseStatus, spawn_reader, write_frame,
};
use crate::io::state_channel::{
    ARTIFACT_DIR, STATE_DIR, clear_dir, loader_snippet, read_artifact, validate_variable_name,
    write_state,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Everything needed to bring up a session.
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Requirements installed with `pip` before any code runs.
    pub packages: Vec<String>,
    /// Tools bound in the namespace before any code runs.
    pub tools: Vec<ToolDefinition>,
    /// Variables pushed after tool setup.
    pub initial_state: BTreeMap<String, WireValue>,
    pub config: SandboxConfig,
}

impl SandboxOptions {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages.extend(packages.into_iter().map(Into::into));
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_state(mut self, state: BTreeMap<String, WireValue>) -> Self {
        self.initial_state = state;
        self
    }
}

/// Outcome of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    /// Final-answer value, or the first image from the log when there is none.
    pub result: Option<WireValue>,
    /// Captured output with image marker lines removed.
    pub log: String,
    pub is_final_answer: bool,
    /// Every image pulled from the log, in order.
    pub images: Vec<Image>,
}

/// Parts of a session reachable from a [`KillSwitch`].
#[derive(Debug)]
struct Shared {
    child: Mutex<Option<Child>>,
    backend: Arc<dyn SandboxBackend>,
    spec: LaunchSpec,
    killed: AtomicBool,
}

impl Shared {
    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.child.lock()
            && let Some(child) = slot.as_mut()
        {
            if let Err(e) = child.kill() {
                debug!(err = %e, "kill sandbox child");
            }
            match child.wait() {
                Ok(status) => debug!(%status, "sandbox child reaped"),
                Err(e) => debug!(err = %e, "wait for sandbox child"),
            }
        }
        if let Err(e) = self.backend.teardown(&self.spec) {
            warn!(err = %format!("{e:#}"), "backend teardown failed");
        }
    }
}

/// Tears a session down from another thread.
///
/// A call blocked in the executor returns
/// [`ExecutorError::EnvironmentUnavailable`] once the switch fires.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    shared: Arc<Shared>,
}

impl KillSwitch {
    pub fn kill(&self) {
        info!(session = %self.shared.spec.session, "kill switch fired");
        self.shared.kill();
    }
}

#[derive(Debug)]
pub struct SandboxExecutor {
    session_id: String,
    config: SandboxConfig,
    io_dir: Option<TempDir>,
    shared: Arc<Shared>,
    stdin: Option<ChildStdin>,
    frames: Receiver<anyhow::Result<DriverMessage>>,
    reader: Option<JoinHandle<()>>,
    stderr: StderrTail,
    installed: BTreeSet<String>,
    next_id: u64,
    poisoned: Option<String>,
    closed: bool,
    span: Span,
}

impl SandboxExecutor {
    /// Start a session: launch the driver, install packages, bind tools and
    /// push the initial state, in that order.
    ///
    /// A failure at any step tears down whatever was already started.
    pub fn new(options: SandboxOptions) -> Result<Self, ExecutorError> {
        let SandboxOptions {
            packages,
            tools,
            initial_state,
            config,
        } = options;
        config
            .validate()
            .map_err(|e| ExecutorError::EnvironmentUnavailable(format!("{e:#}")))?;
        let backend: Arc<dyn SandboxBackend> = Arc::from(backend::from_config(&config));
        Self::with_backend(backend, config, packages, &tools, initial_state)
    }

    /// Like [`SandboxExecutor::new`] with an explicit backend.
    pub fn with_backend(
        backend: Arc<dyn SandboxBackend>,
        config: SandboxConfig,
        packages: Vec<String>,
        tools: &[ToolDefinition],
        initial_state: BTreeMap<String, WireValue>,
    ) -> Result<Self, ExecutorError> {
        let session_id = format!("coderun-{:016x}", rand::random::<u64>());
        let span = info_span!("sandbox", session = %session_id, backend = backend.name());
        let mut executor = span.in_scope(|| Self::launch(session_id, span.clone(), backend, config))?;

        let _span = executor.span.clone().entered();
        executor.wait_ready()?;
        executor.install_packages(packages.as_slice())?;
        if !tools.is_empty() {
            executor.bootstrap_tools(tools)?;
        }
        if !initial_state.is_empty() {
            executor.send_variables(&initial_state)?;
        }
        info!(
            packages = executor.installed.len(),
            tools = tools.len(),
            "sandbox ready"
        );
        Ok(executor)
    }

    fn launch(
        session_id: String,
        span: Span,
        backend: Arc<dyn SandboxBackend>,
        config: SandboxConfig,
    ) -> Result<Self, ExecutorError> {
        let unavailable = |e: anyhow::Error| ExecutorError::EnvironmentUnavailable(format!("{e:#}"));

        let io_dir = tempfile::Builder::new()
            .prefix("coderun-")
            .tempdir()
            .context("create sandbox io directory")
            .map_err(unavailable)?;
        backend::stage_io_dir(io_dir.path()).map_err(unavailable)?;

        let spec = LaunchSpec {
            session: session_id.clone(),
            io_dir: io_dir.path().to_path_buf(),
            host: config.host.clone(),
            port: config.port,
            startup_timeout: config.startup_timeout(),
        };
        backend.prepare(&spec).map_err(unavailable)?;
        let mut child = backend.launch(&spec).map_err(unavailable)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stderr = StderrTail::new(STDERR_TAIL_BYTES);
        if let Some(pipe) = stderr_pipe {
            stderr.spawn_drain(pipe);
        }

        let shared = Arc::new(Shared {
            child: Mutex::new(Some(child)),
            backend,
            spec,
            killed: AtomicBool::new(false),
        });
        let Some(stdout) = stdout else {
            shared.kill();
            return Err(ExecutorError::EnvironmentUnavailable(
                "driver stdout was not piped".to_string(),
            ));
        };
        let (frames, reader) = spawn_reader(stdout);

        Ok(Self {
            session_id,
            config,
            io_dir: Some(io_dir),
            shared,
            stdin,
            frames,
            reader: Some(reader),
            stderr,
            installed: BTreeSet::new(),
            next_id: 1,
            poisoned: None,
            closed: false,
            span,
        })
    }

    fn wait_ready(&mut self) -> Result<(), ExecutorError> {
        let timeout = self.config.startup_timeout();
        match self.frames.recv_timeout(timeout) {
            Ok(Ok(DriverMessage::Ready { pid, python })) => {
                debug!(pid, %python, "driver ready");
                Ok(())
            }
            Ok(Ok(DriverMessage::Response(_))) => Err(self.unavailable("unexpected frame before ready")),
            Ok(Err(err)) => Err(self.unavailable(&format!("{err:#}"))),
            Err(RecvTimeoutError::Timeout) => Err(self.unavailable(&format!(
                "no ready frame within {}s",
                timeout.as_secs()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.unavailable("driver exited during startup"))
            }
        }
    }

    fn bootstrap_tools(&mut self, tools: &[ToolDefinition]) -> Result<(), ExecutorError> {
        let source = render_bootstrap(tools)?;
        debug!(tools = tools.len(), "binding tools");
        match self.run_code(&source, &BTreeMap::new(), false) {
            Ok(_) => Ok(()),
            Err(ExecutorError::CodeExecution { log } | ExecutorError::Timeout { log, .. }) => {
                Err(ExecutorError::ToolSetup { log })
            }
            Err(err) => Err(err),
        }
    }

    /// Run `code`, selecting final-answer mode when its last line is a
    /// top-level `final_answer(<expr>)` call.
    pub fn execute(
        &mut self,
        code: &str,
        extra_state: &BTreeMap<String, WireValue>,
    ) -> Result<ExecutionOutput, ExecutorError> {
        let final_answer = parse_final_answer(code).is_some();
        self.run_code(code, extra_state, final_answer)
    }

    /// Run `code` with the mode chosen by the caller.
    ///
    /// In final-answer mode a trailing `final_answer(<expr>)` is split off and
    /// `<expr>` is evaluated after the rest of the code; its value is returned
    /// as the result. Code without that shape runs unchanged.
    #[instrument(skip_all, parent = &self.span, fields(final_answer = final_answer, state = extra_state.len()))]
    pub fn run_code(
        &mut self,
        code: &str,
        extra_state: &BTreeMap<String, WireValue>,
        final_answer: bool,
    ) -> Result<ExecutionOutput, ExecutorError> {
        let (body, final_expr) = match final_answer.then(|| parse_final_answer(code)).flatten() {
            Some(call) => (call.prelude, Some(call.expr)),
            None => (code.to_string(), None),
        };
        let expects_answer = final_expr.is_some();

        let mut source = String::new();
        if !extra_state.is_empty() {
            let relative = write_state(self.io_path()?, self.next_id, extra_state)?;
            source.push_str(&loader_snippet(&relative));
        }
        source.push_str(&body);

        let response = self.call(RequestKind::Exec, source, final_expr, self.config.timeout());
        self.clear(STATE_DIR);
        self.finish(response?, expects_answer)
    }

    /// Run `code` and return only its captured output.
    pub fn execute_code(&mut self, code: &str) -> Result<String, ExecutorError> {
        self.run_code(code, &BTreeMap::new(), false)
            .map(|output| output.log)
    }

    /// Merge `variables` into the sandbox namespace.
    #[instrument(skip_all, parent = &self.span, fields(count = variables.len()))]
    pub fn send_variables(
        &mut self,
        variables: &BTreeMap<String, WireValue>,
    ) -> Result<(), ExecutorError> {
        if variables.is_empty() {
            return Ok(());
        }
        let relative = write_state(self.io_path()?, self.next_id, variables)?;
        let response = self.call(
            RequestKind::Exec,
            loader_snippet(&relative),
            None,
            self.config.timeout(),
        );
        self.clear(STATE_DIR);
        self.finish(response?, false).map(|_| ())
    }

    /// Read one variable back from the sandbox namespace.
    #[instrument(skip(self), parent = &self.span)]
    pub fn get_variable(&mut self, name: &str) -> Result<WireValue, ExecutorError> {
        validate_variable_name(name)?;
        let response = self.call(
            RequestKind::Exec,
            String::new(),
            Some(name.to_string()),
            self.config.timeout(),
        )?;
        if response.status == ResponseStatus::Error
            && response
                .error
                .as_ref()
                .is_some_and(|err| err.ename == "NameError")
        {
            return Err(ExecutorError::UndefinedVariable {
                name: name.to_string(),
            });
        }
        self.finish(response, true)?
            .result
            .ok_or_else(|| ExecutorError::ResultDecode(format!("no value returned for `{name}`")))
    }

    /// Install requirements with `pip`, skipping ones already installed in
    /// this session.
    #[instrument(skip_all, parent = &self.span, fields(count = packages.len()))]
    pub fn install_packages<S: AsRef<str>>(&mut self, packages: &[S]) -> Result<(), ExecutorError> {
        for package in packages {
            let package = package.as_ref().trim();
            if !is_package_spec(package) {
                return Err(ExecutorError::InvalidName {
                    what: "package",
                    value: package.to_string(),
                });
            }
            if self.installed.contains(package) {
                debug!(package, "already installed");
                continue;
            }
            info!(package, "installing package");
            let timeout = self.config.install_timeout();
            let response = match self.call(RequestKind::Install, package.to_string(), None, timeout) {
                Ok(response) => response,
                Err(ExecutorError::Timeout { log, .. }) => {
                    return Err(ExecutorError::DependencyInstall {
                        package: package.to_string(),
                        log,
                    });
                }
                Err(err) => return Err(err),
            };
            match self.finish(response, false) {
                Ok(_) => {
                    self.installed.insert(package.to_string());
                }
                Err(ExecutorError::CodeExecution { log } | ExecutorError::Timeout { log, .. }) => {
                    return Err(ExecutorError::DependencyInstall {
                        package: package.to_string(),
                        log,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Stop the session and delete its I/O directory. Safe to call more than
    /// once; problems are logged, not returned.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _span = self.span.clone().entered();

        // EOF on stdin makes the driver leave its loop.
        drop(self.stdin.take());
        if let Ok(mut slot) = self.shared.child.lock()
            && let Some(mut child) = slot.take()
        {
            match stop_child(&mut child, SHUTDOWN_GRACE) {
                Ok(status) => debug!(?status, "driver stopped"),
                Err(e) => warn!(err = %format!("{e:#}"), "failed to stop driver"),
            }
        }
        if let Err(e) = self.shared.backend.teardown(&self.shared.spec) {
            warn!(err = %format!("{e:#}"), "backend teardown failed");
        }
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            warn!("frame reader thread panicked");
        }
        if let Some(dir) = self.io_dir.take()
            && let Err(e) = dir.close()
        {
            warn!(err = %e, "failed to remove sandbox io directory");
        }
        info!("sandbox closed");
    }

    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_alive(&self) -> bool {
        if self.closed || self.poisoned.is_some() || self.shared.killed.load(Ordering::SeqCst) {
            return false;
        }
        match self.shared.child.lock() {
            Ok(mut slot) => slot
                .as_mut()
                .is_some_and(|child| matches!(child.try_wait(), Ok(None))),
            Err(_) => false,
        }
    }

    pub fn installed_packages(&self) -> &BTreeSet<String> {
        &self.installed
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Host directory shared with the sandbox; `None` once closed.
    pub fn io_dir(&self) -> Option<&Path> {
        self.io_dir.as_ref().map(TempDir::path)
    }

    fn io_path(&self) -> Result<&Path, ExecutorError> {
        self.io_dir()
            .ok_or_else(|| ExecutorError::EnvironmentUnavailable("executor is closed".to_string()))
    }

    fn ensure_alive(&self) -> Result<(), ExecutorError> {
        if self.closed {
            return Err(ExecutorError::EnvironmentUnavailable(
                "executor is closed".to_string(),
            ));
        }
        if let Some(reason) = &self.poisoned {
            return Err(ExecutorError::EnvironmentUnavailable(reason.clone()));
        }
        if self.shared.killed.load(Ordering::SeqCst) {
            return Err(ExecutorError::EnvironmentUnavailable(
                "sandbox was shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Mark the session unusable, returning the matching error.
    fn unavailable(&mut self, reason: &str) -> ExecutorError {
        let stderr = self.stderr.text();
        let message = if stderr.trim().is_empty() {
            reason.to_string()
        } else {
            format!("{reason}\n{}", stderr.trim_end())
        };
        warn!(reason, "sandbox session unusable");
        self.poisoned = Some(reason.to_string());
        ExecutorError::EnvironmentUnavailable(message)
    }

    fn clear(&self, dir: &str) {
        if let Some(io_dir) = self.io_dir()
            && let Err(e) = clear_dir(io_dir, dir)
        {
            warn!(err = %format!("{e:#}"), dir, "failed to clear sandbox directory");
        }
    }

    /// Send one request and wait for its response.
    fn call(
        &mut self,
        kind: RequestKind,
        code: String,
        final_expr: Option<String>,
        timeout: Duration,
    ) -> Result<Response, ExecutorError> {
        self.ensure_alive()?;
        // Artifacts left by abandoned requests must never be read.
        self.clear(ARTIFACT_DIR);

        let id = self.next_id;
        self.next_id += 1;
        let request = Request {
            id,
            kind,
            code,
            final_expr,
            timeout_secs: timeout.as_secs().max(1),
            output_limit: self.config.output_limit_bytes,
        };

        let sent = match self.stdin.as_mut() {
            Some(stdin) => write_frame(stdin, &request),
            None => Err(anyhow!("driver stdin is closed")),
        };
        if let Err(e) = sent {
            return Err(self.unavailable(&format!("send request: {e:#}")));
        }
        debug!(id, ?kind, "request sent");

        let deadline = Instant::now() + self.config.host_deadline(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.frames.recv_timeout(remaining) {
                Ok(Ok(DriverMessage::Response(response))) if response.id == id => {
                    debug!(id, status = ?response.status, "response received");
                    return Ok(response);
                }
                Ok(Ok(stale)) => {
                    debug!(?stale, "discarding stale frame");
                }
                Ok(Err(err)) => return Err(self.unavailable(&format!("{err:#}"))),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(id, timeout_secs = timeout.as_secs(), "no response, killing sandbox");
                    let log = self.stderr.text();
                    self.poisoned = Some(format!(
                        "sandbox killed after request {id} exceeded its deadline"
                    ));
                    self.shared.kill();
                    return Err(ExecutorError::Timeout { timeout, log });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let reason = if self.shared.killed.load(Ordering::SeqCst) {
                        "sandbox was shut down"
                    } else {
                        "sandbox exited unexpectedly"
                    };
                    return Err(self.unavailable(reason));
                }
            }
        }
    }

    /// Turn a response into the call's outcome.
    fn finish(
        &self,
        response: Response,
        expects_answer: bool,
    ) -> Result<ExecutionOutput, ExecutorError> {
        let output = with_truncation_notice(response.output, response.output_truncated, "output");
        match response.status {
            ResponseStatus::Timeout => Err(ExecutorError::Timeout {
                timeout: self.config.timeout(),
                log: output,
            }),
            ResponseStatus::Error => {
                let mut log = output;
                if let Some(error) = response.error {
                    if !log.is_empty() && !log.ends_with('\n') {
                        log.push('\n');
                    }
                    log.push_str(&error.traceback);
                }
                Err(ExecutorError::CodeExecution { log })
            }
            ResponseStatus::Ok => {
                let parsed = extract_images(&output);
                let (result, is_final_answer) = match &response.artifact {
                    Some(artifact) => (
                        Some(read_artifact(self.io_path()?, artifact)?),
                        expects_answer || response.final_answer,
                    ),
                    None => (parsed.images.first().cloned().map(WireValue::Image), false),
                };
                Ok(ExecutionOutput {
                    result,
                    log: parsed.log,
                    is_final_answer,
                    images: parsed.images,
                })
            }
        }
    }
}

impl Drop for SandboxExecutor {
    fn drop(&mut self) {
        self.close();
    }
}
