//! `coderun`: run code snippets in a sandbox and inspect agent memory files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use coderun::core::memory::MemoryStore;
use coderun::core::steps::{ActionStep, MessageOptions, StepRecord};
use coderun::core::types::ToolCall;
use coderun::io::config::load_config;
use coderun::io::memory_store::{load_memory, load_memory_or_default, write_memory};
use coderun::{AgentError, ExecutionOutput, ExecutorError, SandboxExecutor, SandboxOptions, WireValue};
use coderun::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "coderun",
    version,
    about = "Sandboxed code execution and agent memory replay"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a code file in a fresh sandbox; the result is printed as JSON.
    Exec {
        /// File holding the code to run.
        file: PathBuf,
        /// JSON object of variables to push before running.
        #[arg(long)]
        state: Option<String>,
        /// Sandbox configuration file.
        #[arg(long, default_value = "coderun.toml")]
        config: PathBuf,
        /// Force final-answer mode instead of detecting it.
        #[arg(long)]
        final_answer: bool,
        /// Package to install first (repeatable).
        #[arg(long = "package")]
        packages: Vec<String>,
        /// Append the run as an action step to this memory file.
        #[arg(long)]
        memory: Option<PathBuf>,
    },
    /// Print the messages a memory file projects to, as JSON.
    Replay {
        memory: PathBuf,
        /// Drop system prompts, plans and raw model output.
        #[arg(long)]
        summary: bool,
        /// Include per-step memory snapshots.
        #[arg(long)]
        raw_memory: bool,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long, default_value = "coderun.toml")]
        path: PathBuf,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Exec {
            file,
            state,
            config,
            final_answer,
            packages,
            memory,
        } => cmd_exec(
            &file,
            state.as_deref(),
            &config,
            final_answer,
            packages,
            memory.as_deref(),
        ),
        Command::Replay {
            memory,
            summary,
            raw_memory,
        } => cmd_replay(&memory, summary, raw_memory),
        Command::Config { path } => cmd_config(&path),
    }
}

fn cmd_exec(
    file: &Path,
    state: Option<&str>,
    config_path: &Path,
    final_answer: bool,
    packages: Vec<String>,
    memory_path: Option<&Path>,
) -> Result<i32> {
    let code = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let state = parse_state(state)?;
    let config = load_config(config_path)?;
    let mut memory = memory_path.map(load_memory_or_default).transpose()?;

    let started = now_secs();
    let options = SandboxOptions::new(config).with_packages(packages);
    let outcome = SandboxExecutor::new(options).and_then(|mut executor| {
        let output = if final_answer {
            executor.run_code(&code, &state, true)
        } else {
            executor.execute(&code, &state)
        };
        executor.close();
        output
    });

    if let (Some(memory), Some(path)) = (memory.as_mut(), memory_path) {
        let step = action_step(memory, &code, &outcome, started);
        memory.append(step);
        write_memory(path, memory)?;
    }

    match outcome {
        Ok(output) => {
            eprint!("{}", output.log);
            let result = output.result.as_ref().map(WireValue::to_json);
            let doc = json!({
                "result": result,
                "is_final_answer": output.is_final_answer,
                "images": output.images.len(),
            });
            println!("{}", serde_json::to_string_pretty(&doc).context("serialize result")?);
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_code_for(&err))
        }
    }
}

fn cmd_replay(path: &Path, summary: bool, raw_memory: bool) -> Result<i32> {
    let memory = load_memory(path)?;
    let options = MessageOptions {
        summary_mode: summary,
        include_raw_memory: raw_memory,
    };
    let messages = memory.to_messages(options);
    println!(
        "{}",
        serde_json::to_string_pretty(&messages).context("serialize messages")?
    );
    Ok(exit_codes::OK)
}

fn cmd_config(path: &Path) -> Result<i32> {
    let config = load_config(path)?;
    print!("{}", toml::to_string_pretty(&config).context("serialize config")?);
    Ok(exit_codes::OK)
}

fn parse_state(raw: Option<&str>) -> Result<BTreeMap<String, WireValue>> {
    let Some(raw) = raw else {
        return Ok(BTreeMap::new());
    };
    let value: Value = serde_json::from_str(raw).context("parse --state JSON")?;
    let Value::Object(entries) = value else {
        bail!("--state must be a JSON object");
    };
    Ok(entries
        .iter()
        .map(|(name, value)| (name.clone(), WireValue::from_json(value)))
        .collect())
}

fn action_step(
    memory: &MemoryStore,
    code: &str,
    outcome: &Result<ExecutionOutput, ExecutorError>,
    started: f64,
) -> ActionStep {
    let step_number = memory
        .steps()
        .iter()
        .filter(|step| matches!(step, StepRecord::Action(_)))
        .count() as u32
        + 1;
    let mut action = ActionStep::new(step_number, started);
    action.record_tool_calls(vec![ToolCall::new(
        "python_interpreter",
        Value::String(code.to_string()),
        format!("call_{step_number}"),
    )]);
    match outcome {
        Ok(output) => {
            let last = output
                .result
                .as_ref()
                .map(|value| value.to_json().to_string())
                .unwrap_or_else(|| "None".to_string());
            action.record_observation(
                format!("Execution logs:\n{}Last output from code snippet:\n{last}", output.log),
                output.result.clone(),
            );
            action.record_images(output.images.clone());
        }
        Err(err) => action.record_error(AgentError::from(err)),
    }
    action.finish(now_secs());
    action
}

fn exit_code_for(err: &ExecutorError) -> i32 {
    match err {
        ExecutorError::Timeout { .. } => exit_codes::TIMEOUT,
        ExecutorError::CodeExecution { .. }
        | ExecutorError::ResultDecode(_)
        | ExecutorError::UndefinedVariable { .. } => exit_codes::EXECUTION_FAILED,
        _ => exit_codes::INVALID,
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
