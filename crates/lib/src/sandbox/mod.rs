//! Disposable per-formula build directories.
//!
//! [`prepare`] creates a uniquely named directory, extracts the fetched source
//! into `src/`, applies the formula's active patches and computes the
//! environment overlay the recipe runs under. The returned [`Sandbox`] removes
//! the directory when dropped, unless the build context asked to keep it.

pub mod archive;
pub mod env;
pub mod patch;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::SOURCE_DATE_EPOCH;
use crate::formula::{EnvAction, FlagSet, Formula, PatchSource};
use crate::placeholder::{self, PlaceholderError, Resolver, Variable};
use crate::platform::Platform;

pub use env::EnvOverlay;
pub use patch::{LoadedPatch, PatchError};

#[derive(Debug, Error)]
pub enum SandboxError {
  #[error("sandbox I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to extract {archive}: {message}")]
  Extract { archive: PathBuf, message: String },

  #[error("{formula}: tool {variable} not found at {path}")]
  MissingTool {
    formula: String,
    variable: String,
    path: PathBuf,
  },

  #[error("{formula}: {source}")]
  Placeholder {
    formula: String,
    #[source]
    source: PlaceholderError,
  },

  #[error(transparent)]
  Patch(#[from] PatchError),

  #[error("sandbox task failed: {0}")]
  Task(String),
}

impl SandboxError {
  pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> SandboxError + '_ {
    move |source| SandboxError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Everything a single formula build needs to know about its surroundings.
#[derive(Debug, Clone)]
pub struct BuildContext {
  /// Installation prefix, `<root>/<name>/<version>`.
  pub prefix: PathBuf,
  pub flags: FlagSet,
  pub platform: Platform,
  pub jobs: usize,
  pub keep_sandbox: bool,
  /// Prefixes of the formula's dependencies, for `$${formula:NAME}`.
  pub dependency_prefixes: BTreeMap<String, PathBuf>,
  /// Directory sandboxes are created in; the system temp dir when unset.
  pub sandbox_parent: Option<PathBuf>,
}

/// Placeholder values for one build.
#[derive(Debug, Clone)]
pub struct BuildVars {
  formula: String,
  prefix: String,
  version: String,
  version_suffix: Option<String>,
  src: String,
  jobs: String,
  formulas: BTreeMap<String, String>,
}

impl BuildVars {
  pub fn new(formula: &Formula, ctx: &BuildContext, src: &Path) -> Self {
    Self {
      formula: formula.name.clone(),
      prefix: ctx.prefix.to_string_lossy().into_owned(),
      version: formula.version(),
      version_suffix: formula.version_suffix(),
      src: src.to_string_lossy().into_owned(),
      jobs: ctx.jobs.to_string(),
      formulas: ctx
        .dependency_prefixes
        .iter()
        .map(|(name, path)| (name.clone(), path.to_string_lossy().into_owned()))
        .collect(),
    }
  }

  /// Substitute placeholders in `input`, labelling errors with the formula.
  pub fn expand(&self, input: &str) -> Result<String, SandboxError> {
    placeholder::substitute(input, self).map_err(|source| SandboxError::Placeholder {
      formula: self.formula.clone(),
      source,
    })
  }
}

impl Resolver for BuildVars {
  fn resolve_var(&self, var: Variable) -> Result<&str, PlaceholderError> {
    match var {
      Variable::Prefix => Ok(&self.prefix),
      Variable::Name => Ok(&self.formula),
      Variable::Version => Ok(&self.version),
      Variable::VersionSuffix => self
        .version_suffix
        .as_deref()
        .ok_or(PlaceholderError::UnresolvedVariable(var.as_str())),
      Variable::Src => Ok(&self.src),
      Variable::Jobs => Ok(&self.jobs),
    }
  }

  fn resolve_formula(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .formulas
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnresolvedFormula(name.to_string()))
  }
}

/// A prepared build directory. Dropping it removes the directory.
#[derive(Debug)]
pub struct Sandbox {
  dir: Option<TempDir>,
  path: PathBuf,
  source_root: PathBuf,
  env: EnvOverlay,
  vars: BuildVars,
  keep: bool,
}

impl Sandbox {
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Root of the extracted (and patched) source tree.
  pub fn source_root(&self) -> &Path {
    &self.source_root
  }

  pub fn env(&self) -> &EnvOverlay {
    &self.env
  }

  pub fn vars(&self) -> &BuildVars {
    &self.vars
  }
}

impl Drop for Sandbox {
  fn drop(&mut self) {
    let Some(dir) = self.dir.take() else {
      return;
    };
    if self.keep {
      let path = dir.keep();
      warn!(path = ?path, formula = %self.vars.formula, "keeping build sandbox");
    } else {
      debug!(path = ?self.path, "removing build sandbox");
    }
  }
}

/// Create the sandbox for `formula`, with `source` (the fetched file) unpacked into it.
///
/// Formulas without a source get an empty source tree.
pub async fn prepare(formula: &Formula, source: Option<&Path>, ctx: &BuildContext) -> Result<Sandbox, SandboxError> {
  let mut builder = tempfile::Builder::new();
  let prefix = format!("kiln-{}-", formula.name);
  builder.prefix(&prefix);
  let parent = ctx.sandbox_parent.clone().unwrap_or_else(std::env::temp_dir);
  std::fs::create_dir_all(&parent).map_err(SandboxError::io(&parent))?;
  let dir = builder.tempdir_in(&parent).map_err(SandboxError::io(&parent))?;
  let path = dir.path().to_path_buf();
  // The handle owns the directory from here on, so early returns clean up.
  let mut sandbox = Sandbox {
    dir: Some(dir),
    path: path.clone(),
    source_root: path.join("src"),
    env: EnvOverlay::new(),
    vars: BuildVars::new(formula, ctx, &path.join("src")),
    keep: ctx.keep_sandbox,
  };

  let tmp = path.join("tmp");
  std::fs::create_dir_all(&tmp).map_err(SandboxError::io(&tmp))?;
  std::fs::create_dir_all(&sandbox.source_root).map_err(SandboxError::io(&sandbox.source_root))?;

  let patches = load_patches(formula, &ctx.flags, &ctx.platform)?;
  let src_dir = sandbox.source_root.clone();
  let archive = source.map(Path::to_path_buf);
  let source_root = tokio::task::spawn_blocking(move || -> Result<PathBuf, SandboxError> {
    let root = match archive {
      Some(archive) => archive::extract(&archive, &src_dir)?,
      None => src_dir,
    };
    patch::apply_all(&root, &patches)?;
    Ok(root)
  })
  .await
  .map_err(|e| SandboxError::Task(e.to_string()))??;

  sandbox.vars = BuildVars::new(formula, ctx, &source_root);
  sandbox.source_root = source_root;
  sandbox.env = build_env(formula, ctx, &sandbox.vars, &tmp)?;

  info!(formula = %formula.name, path = ?sandbox.path, "sandbox prepared");
  Ok(sandbox)
}

fn load_patches(formula: &Formula, flags: &FlagSet, platform: &Platform) -> Result<Vec<LoadedPatch>, SandboxError> {
  formula
    .active_patches(flags, platform)
    .into_iter()
    .enumerate()
    .map(|(index, spec)| {
      let (label, text) = match &spec.source {
        PatchSource::File(path) => {
          let text = std::fs::read_to_string(path).map_err(|source| PatchError::Read {
            path: path.clone(),
            source,
          })?;
          (path.display().to_string(), text)
        }
        PatchSource::Inline(text) => (format!("{} inline patch {}", formula.name, index + 1), text.clone()),
      };
      Ok(LoadedPatch {
        label,
        text,
        strip: spec.strip,
      })
    })
    .collect()
}

/// Baseline variables first, then the formula's active rules in order.
fn build_env(formula: &Formula, ctx: &BuildContext, vars: &BuildVars, tmp: &Path) -> Result<EnvOverlay, SandboxError> {
  let mut overlay = EnvOverlay::new();
  overlay.set("TMPDIR", tmp.to_string_lossy());
  overlay.set("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH);
  overlay.set("MAKEFLAGS", format!("-j{}", ctx.jobs));

  for rule in formula.active_env(&ctx.flags, &ctx.platform) {
    match &rule.action {
      EnvAction::Set(value) => {
        let value = vars.expand(value)?;
        if rule.tool && !Path::new(&value).exists() {
          return Err(SandboxError::MissingTool {
            formula: formula.name.clone(),
            variable: rule.name.clone(),
            path: PathBuf::from(value),
          });
        }
        overlay.set(rule.name.as_str(), value);
      }
      EnvAction::Unset => overlay.unset(rule.name.as_str()),
    }
  }
  Ok(overlay)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::formula::parse_formula;
  use crate::platform::{Arch, Os};
  use tracing_test::traced_test;

  fn context(temp: &Path) -> BuildContext {
    BuildContext {
      prefix: temp.join("root/avr-gcc/4.8.2"),
      flags: FlagSet::new(),
      platform: Platform::new(Os::Linux, Arch::X86_64, None),
      jobs: 4,
      keep_sandbox: false,
      dependency_prefixes: BTreeMap::from([("avr-binutils".to_string(), temp.join("root/avr-binutils/2.24"))]),
      sandbox_parent: Some(temp.join("sandboxes")),
    }
  }

  fn tar_source(dir: &Path) -> PathBuf {
    let mut builder = tar::Builder::new(Vec::new());
    let contents = "old line\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
      .append_data(&mut header, "gcc-4.8.2/gcc/config.h", contents.as_bytes())
      .unwrap();
    let path = dir.join("gcc-4.8.2.tar");
    std::fs::write(&path, builder.into_inner().unwrap()).unwrap();
    path
  }

  const FORMULA: &str = r#"
name = "avr-gcc"
version = "4.8.2"

[[patches]]
inline = """
--- a/gcc/config.h
+++ b/gcc/config.h
@@ -1 +1 @@
-old line
+new line
"""

[[patches]]
inline = "not applied"
when = { platform = { os = "macos" } }

[[env]]
name = "LD"
unset = true

[[env]]
name = "AS_FOR_TARGET"
value = "$${formula:avr-binutils}/bin/avr-as"
"#;

  #[tokio::test]
  async fn prepare_extracts_patches_and_builds_env() {
    let temp = tempfile::TempDir::new().unwrap();
    let formula = parse_formula(FORMULA, None).unwrap();
    let ctx = context(temp.path());
    let source = tar_source(temp.path());

    let sandbox = prepare(&formula, Some(&source), &ctx).await.unwrap();

    assert!(sandbox.source_root().ends_with("src/gcc-4.8.2"));
    assert_eq!(
      std::fs::read_to_string(sandbox.source_root().join("gcc/config.h")).unwrap(),
      "new line\n"
    );
    let env = sandbox.env();
    assert_eq!(env.lookup("LD"), None);
    assert_eq!(env.lookup("MAKEFLAGS").as_deref(), Some("-j4"));
    assert_eq!(
      env.lookup("AS_FOR_TARGET").map(PathBuf::from),
      Some(temp.path().join("root/avr-binutils/2.24/bin/avr-as"))
    );
    assert_eq!(env.lookup("TMPDIR").map(PathBuf::from), Some(sandbox.path().join("tmp")));
    assert_eq!(sandbox.vars().resolve_var(Variable::VersionSuffix), Ok("4.8"));
  }

  #[tokio::test]
  async fn sandbox_is_removed_on_drop() {
    let temp = tempfile::TempDir::new().unwrap();
    let formula = parse_formula("name = \"empty\"\n", None).unwrap();

    let sandbox = prepare(&formula, None, &context(temp.path())).await.unwrap();
    let path = sandbox.path().to_path_buf();
    assert!(path.join("src").is_dir());
    assert!(path.file_name().unwrap().to_string_lossy().starts_with("kiln-empty-"));

    drop(sandbox);
    assert!(!path.exists());
  }

  #[tokio::test]
  #[traced_test]
  async fn kept_sandbox_survives_and_is_logged() {
    let temp = tempfile::TempDir::new().unwrap();
    let formula = parse_formula("name = \"empty\"\n", None).unwrap();
    let mut ctx = context(temp.path());
    ctx.keep_sandbox = true;

    let sandbox = prepare(&formula, None, &ctx).await.unwrap();
    let path = sandbox.path().to_path_buf();
    drop(sandbox);

    assert!(path.exists());
    assert!(logs_contain("keeping build sandbox"));
  }

  #[tokio::test]
  async fn missing_tool_fails_and_cleans_up() {
    let temp = tempfile::TempDir::new().unwrap();
    let text = "name = \"avr-libc\"\n\n[[env]]\nname = \"AS\"\nvalue = \"/nonexistent/cctools/bin/as\"\ntool = true\n";
    let formula = parse_formula(text, None).unwrap();
    let ctx = context(temp.path());

    let err = prepare(&formula, None, &ctx).await.unwrap_err();

    assert!(matches!(err, SandboxError::MissingTool { ref variable, .. } if variable == "AS"));
    let leftovers = std::fs::read_dir(temp.path().join("sandboxes")).unwrap().count();
    assert_eq!(leftovers, 0);
  }

  #[tokio::test]
  async fn failed_patch_is_reported() {
    let temp = tempfile::TempDir::new().unwrap();
    let text = "name = \"broken\"\n\n[[patches]]\ninline = \"--- a/x\\n+++ b/x\\n@@ -1 +1 @@\\n-a\\n+b\\n\"\n";
    let formula = parse_formula(text, None).unwrap();

    let err = prepare(&formula, None, &context(temp.path())).await.unwrap_err();

    assert!(matches!(err, SandboxError::Patch(PatchError::Rejected { .. })));
  }
}
