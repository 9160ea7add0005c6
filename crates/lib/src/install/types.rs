//! Types for install orchestration.
//!
//! This module defines the configuration, the error taxonomy with its exit
//! codes, and the per-run report of an install.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::fetch::FetchError;
use crate::finish::{FinishError, FinishReport};
use crate::formula::{FlagSet, Formula};
use crate::lock::LockError;
use crate::placeholder::PlaceholderError;
use crate::platform::{Platform, paths};
use crate::recipe::BuildFailure;
use crate::resolve::{PlanEntry, ResolveError};
use crate::sandbox::{PatchError, SandboxError};

/// The error categories callers act on, each with a stable process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Cycle,
  MissingDependency,
  Fetch,
  ChecksumMismatch,
  Patch,
  Build,
  ConflictResolution,
  Other,
}

impl ErrorKind {
  pub fn exit_code(self) -> i32 {
    match self {
      ErrorKind::Other => 1,
      ErrorKind::Cycle => 3,
      ErrorKind::MissingDependency => 4,
      ErrorKind::Fetch => 5,
      ErrorKind::ChecksumMismatch => 6,
      ErrorKind::Patch => 7,
      ErrorKind::Build => 8,
      ErrorKind::ConflictResolution => 9,
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::Cycle => "CycleError",
      ErrorKind::MissingDependency => "MissingDependencyError",
      ErrorKind::Fetch => "FetchError",
      ErrorKind::ChecksumMismatch => "ChecksumMismatchError",
      ErrorKind::Patch => "PatchError",
      ErrorKind::Build => "BuildFailure",
      ErrorKind::ConflictResolution => "ConflictResolutionError",
      ErrorKind::Other => "Error",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Error)]
pub enum InstallError {
  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Sandbox(#[from] SandboxError),

  #[error(transparent)]
  Build(#[from] BuildFailure),

  #[error(transparent)]
  Finish(#[from] FinishError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid completion marker {path}: {message}")]
  Marker { path: PathBuf, message: String },

  #[error("install task failed: {0}")]
  Task(String),
}

impl InstallError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      InstallError::Resolve(ResolveError::Cycle { .. }) => ErrorKind::Cycle,
      InstallError::Resolve(_) => ErrorKind::MissingDependency,
      InstallError::Fetch(FetchError::ChecksumMismatch { .. }) => ErrorKind::ChecksumMismatch,
      InstallError::Fetch(_) => ErrorKind::Fetch,
      InstallError::Sandbox(SandboxError::Patch(_)) => ErrorKind::Patch,
      InstallError::Sandbox(SandboxError::MissingTool { .. }) => ErrorKind::MissingDependency,
      InstallError::Sandbox(SandboxError::Placeholder {
        source: PlaceholderError::UnresolvedFormula(_),
        ..
      }) => ErrorKind::MissingDependency,
      InstallError::Sandbox(_) => ErrorKind::Other,
      InstallError::Build(_) => ErrorKind::Build,
      InstallError::Finish(_) => ErrorKind::ConflictResolution,
      InstallError::Lock(_) | InstallError::Io { .. } | InstallError::Marker { .. } | InstallError::Task(_) => {
        ErrorKind::Other
      }
    }
  }

  pub fn exit_code(&self) -> i32 {
    self.kind().exit_code()
  }

  /// The failed build command record, if this is a build failure.
  pub fn build_failure(&self) -> Option<&BuildFailure> {
    match self {
      InstallError::Build(failure) => Some(failure),
      _ => None,
    }
  }

  /// Output tail of a failed build command, if this is one.
  pub fn output_tail(&self) -> Option<&str> {
    self.build_failure().map(|failure| failure.output_tail.as_str())
  }
}

impl From<PatchError> for InstallError {
  fn from(error: PatchError) -> Self {
    InstallError::Sandbox(SandboxError::Patch(error))
  }
}

/// Settings for one install run.
#[derive(Debug, Clone)]
pub struct InstallConfig {
  /// Installation root; formulas go to `<root>/<name>/<version>`.
  pub root: PathBuf,
  /// Download cache directory.
  pub cache: PathBuf,
  pub flags: FlagSet,
  /// Build parallelism, exported as `MAKEFLAGS=-j<jobs>` and `$${jobs}`.
  pub jobs: usize,
  /// Keep sandboxes after the build for debugging.
  pub keep_sandbox: bool,
  /// Maximum number of concurrent source downloads.
  pub fetch_parallelism: usize,
  pub platform: Platform,
  pub fetch_timeout: Duration,
  /// Where sandboxes are created; the system temp dir when unset.
  pub sandbox_parent: Option<PathBuf>,
}

impl InstallConfig {
  pub fn new(root: impl Into<PathBuf>, cache: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      cache: cache.into(),
      flags: FlagSet::new(),
      jobs: num_cpus(),
      keep_sandbox: false,
      fetch_parallelism: 4,
      platform: Platform::current(),
      fetch_timeout: Duration::from_secs(300),
      sandbox_parent: None,
    }
  }

  /// Installation prefix of `formula`.
  pub fn prefix(&self, formula: &Formula) -> PathBuf {
    self.root.join(&formula.name).join(formula.version())
  }
}

impl Default for InstallConfig {
  /// Root and cache from `KILN_ROOT` / `KILN_CACHE`, else the XDG directories.
  fn default() -> Self {
    Self::new(paths::root_dir(), paths::cache_dir())
  }
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// A formula installed by this run.
#[derive(Debug, Clone, Serialize)]
pub struct InstalledFormula {
  pub name: String,
  pub version: String,
  pub prefix: PathBuf,
  pub finish: FinishReport,
}

/// A formula not attempted because a dependency failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFormula {
  pub name: String,
  /// The failed formula this one (transitively) depends on.
  pub failed_dependency: String,
}

impl fmt::Display for SkippedFormula {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} (dependency {} failed)", self.name, self.failed_dependency)
  }
}

/// Result of an install run.
///
/// Failures of individual formulas do not abort the run: independent
/// formulas still install, dependents of a failed one are skipped.
#[derive(Debug, Default)]
pub struct InstallReport {
  pub plan: Vec<PlanEntry>,
  pub installed: Vec<InstalledFormula>,
  pub already_installed: Vec<String>,
  /// Failures in plan order.
  pub failed: Vec<(String, InstallError)>,
  pub skipped: Vec<SkippedFormula>,
}

impl InstallReport {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  /// Exit code of the first failure in plan order, 0 when nothing failed.
  pub fn exit_code(&self) -> i32 {
    self.failed.first().map(|(_, e)| e.exit_code()).unwrap_or(0)
  }
}
