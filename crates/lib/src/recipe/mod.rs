//! Recipe execution.
//!
//! A formula's recipe is turned into a list of [`Invocation`]s up front, with
//! every placeholder substituted. [`run`] then executes them strictly in order
//! inside the sandbox; the first failing command stops the recipe.

pub mod args;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::consts::OUTPUT_TAIL_LINES;
use crate::formula::{FlagSet, Formula, StepCommand};
use crate::sandbox::{EnvOverlay, Sandbox, SandboxError};

pub use args::configure_args;

/// A build command failed. Carries the end of its output for diagnosis.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{formula}: `{command}` {}", describe_exit(.exit_code))]
pub struct BuildFailure {
  pub formula: String,
  pub command: String,
  /// `None` when the process could not be started or was killed by a signal.
  pub exit_code: Option<i32>,
  pub output_tail: String,
}

fn describe_exit(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("exited with status {code}"),
    None => "did not run to completion".to_string(),
  }
}

/// One external command of a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
  pub program: String,
  pub args: Vec<String>,
  /// Created on demand, so out-of-tree build directories need no extra step.
  pub cwd: PathBuf,
  pub env: EnvOverlay,
}

impl Invocation {
  /// Human-readable command line, for logs and failure reports.
  pub fn command_line(&self) -> String {
    std::iter::once(self.program.as_str())
      .chain(self.args.iter().map(String::as_str))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

/// Outcome of running a recipe.
#[derive(Debug, Clone)]
pub struct InstallResult {
  pub success: bool,
  /// Output of every command that ran, stdout before stderr per command.
  pub captured_output: String,
  /// Exit code of the last command that ran.
  pub exit_code: Option<i32>,
  pub failure: Option<BuildFailure>,
}

/// Compute the invocations for `formula`: configure first, then the declared steps.
pub fn invocations(formula: &Formula, sandbox: &Sandbox, prefix: &Path, flags: &FlagSet) -> Result<Vec<Invocation>, SandboxError> {
  let vars = sandbox.vars();
  let root = sandbox.source_root();
  let build_dir = formula
    .configure
    .as_ref()
    .and_then(|c| c.build_dir.as_deref())
    .map(|dir| root.join(dir))
    .unwrap_or_else(|| root.to_path_buf());

  let mut result = Vec::new();

  if let Some(spec) = &formula.configure {
    let args = configure_args(spec, prefix, formula.version_suffix().as_deref(), flags)
      .iter()
      .map(|arg| vars.expand(arg))
      .collect::<Result<Vec<_>, _>>()?;
    // A script with a directory part is relative to the build directory, not the orchestrator.
    let program = if spec.script.contains('/') || spec.script.contains('\\') {
      build_dir.join(&spec.script).to_string_lossy().into_owned()
    } else {
      spec.script.clone()
    };
    result.push(Invocation {
      program,
      args,
      cwd: build_dir.clone(),
      env: sandbox.env().clone(),
    });
  }

  for step in &formula.steps {
    let cwd = step.cwd.as_deref().map(|dir| root.join(dir)).unwrap_or_else(|| build_dir.clone());
    let (program, args) = match &step.command {
      StepCommand::Program { program, args } => (
        vars.expand(program)?,
        args.iter().map(|arg| vars.expand(arg)).collect::<Result<Vec<_>, _>>()?,
      ),
      StepCommand::Shell(script) => {
        let (shell, mut args) = get_shell();
        args.push(vars.expand(script)?);
        (shell, args)
      }
    };
    result.push(Invocation {
      program,
      args,
      cwd,
      env: sandbox.env().clone(),
    });
  }

  Ok(result)
}

/// Run `invocations` in order. Stops at the first failure.
///
/// Children are spawned with `kill_on_drop`, so dropping the returned future
/// (for example on Ctrl-C) terminates the running command.
pub async fn run(formula: &Formula, invocations: &[Invocation]) -> InstallResult {
  let mut captured = String::new();
  let mut exit_code = None;

  for invocation in invocations {
    let command_line = invocation.command_line();
    info!(formula = %formula.name, command = %command_line, "running");

    let failure = |exit_code: Option<i32>, output: &str| BuildFailure {
      formula: formula.name.clone(),
      command: command_line.clone(),
      exit_code,
      output_tail: tail(output, OUTPUT_TAIL_LINES),
    };

    if let Err(e) = tokio::fs::create_dir_all(&invocation.cwd).await {
      let message = format!("cannot create working directory {}: {e}", invocation.cwd.display());
      return failed(captured, None, failure(None, &message));
    }

    let mut command = Command::new(&invocation.program);
    command
      .args(&invocation.args)
      .current_dir(&invocation.cwd)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    invocation.env.apply(&mut command);

    debug!(cwd = ?invocation.cwd, "spawning process");

    let output = match command.output().await {
      Ok(output) => output,
      Err(e) => {
        let message = format!("failed to start {}: {e}", invocation.program);
        warn!(formula = %formula.name, error = %e, "spawn failed");
        captured.push_str(&message);
        captured.push('\n');
        return failed(captured, None, failure(None, &message));
      }
    };

    let mut output_text = String::from_utf8_lossy(&output.stdout).into_owned();
    output_text.push_str(&String::from_utf8_lossy(&output.stderr));
    captured.push_str(&output_text);
    exit_code = output.status.code();

    if !output.status.success() {
      warn!(formula = %formula.name, command = %command_line, exit_code = ?exit_code, "command failed");
      let failure = failure(exit_code, &output_text);
      return failed(captured, exit_code, failure);
    }
  }

  InstallResult {
    success: true,
    captured_output: captured,
    exit_code,
    failure: None,
  }
}

fn failed(captured_output: String, exit_code: Option<i32>, failure: BuildFailure) -> InstallResult {
  InstallResult {
    success: false,
    captured_output,
    exit_code,
    failure: Some(failure),
  }
}

/// Last `lines` lines of `output`.
fn tail(output: &str, lines: usize) -> String {
  let all: Vec<&str> = output.lines().collect();
  all[all.len().saturating_sub(lines)..].join("\n")
}

/// The shell used for `shell` steps.
///
/// Always `/bin/sh` (or PowerShell on Windows) rather than `$SHELL`, which may
/// source user profiles that change the build environment.
fn get_shell() -> (String, Vec<String>) {
  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
