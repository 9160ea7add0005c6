//! Loading and validating formula descriptors from disk.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::{FormulaError, FormulaSet};
use super::types::{EnvAction, Formula, PatchSource};

/// Load every `*.toml` descriptor in `dir`, in file-name order.
pub fn load_dir(dir: &Path) -> Result<FormulaSet, FormulaError> {
  let read_err = |source| FormulaError::Read {
    path: dir.to_path_buf(),
    source,
  };

  let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
    .map_err(read_err)?
    .filter_map(|entry| entry.ok().map(|e| e.path()))
    .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
    .collect();
  paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

  let mut set = FormulaSet::new();
  for path in paths {
    let formula = load_file(&path)?;
    set.insert(formula, path)?;
  }

  debug!(dir = ?dir, count = set.len(), "loaded formulas");
  Ok(set)
}

/// Load a single descriptor file.
pub fn load_file(path: &Path) -> Result<Formula, FormulaError> {
  let text = std::fs::read_to_string(path).map_err(|source| FormulaError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  parse_formula(&text, Some(path))
}

/// Parse and validate descriptor text.
///
/// When `path` is given, relative patch files are resolved against its directory.
pub fn parse_formula(text: &str, path: Option<&Path>) -> Result<Formula, FormulaError> {
  let mut formula: Formula = toml::from_str(text).map_err(|source| FormulaError::Parse {
    path: path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("<inline>")),
    source: Box::new(source),
  })?;

  if let Some(base) = path.and_then(Path::parent) {
    for patch in &mut formula.patches {
      if let PatchSource::File(file) = &mut patch.source
        && file.is_relative()
      {
        *file = base.join(&*file);
      }
    }
  }

  validate(&formula, path.is_some())?;
  Ok(formula)
}

fn validate(formula: &Formula, check_files: bool) -> Result<(), FormulaError> {
  let invalid = |message: String| FormulaError::Invalid {
    name: formula.name.clone(),
    message,
  };

  if !is_path_component(&formula.name) {
    return Err(invalid("name must be a plain file name (letters, digits, '.', '_', '+', '-')".into()));
  }
  if let Some(version) = &formula.version
    && !is_path_component(version)
  {
    return Err(invalid(format!("version '{version}' is not a valid directory name")));
  }

  match (&formula.url, &formula.checksum) {
    (Some(_), None) => return Err(invalid("checksum is mandatory when url is set".into())),
    (None, _) if formula.mirror.is_some() => return Err(invalid("mirror is set without url".into())),
    _ => {}
  }

  for flag in formula.referenced_flags() {
    if !formula.feature_flags.contains_key(flag) {
      return Err(invalid(format!("condition uses undeclared feature flag '{flag}'")));
    }
  }

  for rule in &formula.env {
    if rule.name.is_empty() || rule.name.contains('=') {
      return Err(invalid(format!("invalid environment variable name '{}'", rule.name)));
    }
    if let EnvAction::Set(value) = &rule.action {
      crate::placeholder::parse(value).map_err(|e| invalid(format!("env '{}': {e}", rule.name)))?;
    }
  }

  if let Some(configure) = &formula.configure {
    if let Some(dir) = &configure.build_dir {
      ensure_relative(dir).map_err(|m| invalid(format!("configure.build_dir: {m}")))?;
    }
    for arg in &configure.args {
      crate::placeholder::parse(arg).map_err(|e| invalid(format!("configure arg '{arg}': {e}")))?;
    }
  }

  for step in &formula.steps {
    if let Some(cwd) = &step.cwd {
      ensure_relative(cwd).map_err(|m| invalid(format!("step cwd: {m}")))?;
    }
  }

  for entry in formula.finish.version_suffix.iter().chain(&formula.finish.remove) {
    crate::finish::checked_relative(formula, entry).map_err(|e| invalid(e.to_string()))?;
  }
  for glob in &formula.finish.version_suffix {
    glob::Pattern::new(glob).map_err(|e| invalid(format!("finish glob '{glob}': {e}")))?;
  }

  if check_files {
    for patch in &formula.patches {
      if let PatchSource::File(file) = &patch.source
        && !file.is_file()
      {
        return Err(invalid(format!("patch file {} does not exist", file.display())));
      }
    }
  }

  Ok(())
}

fn is_path_component(s: &str) -> bool {
  !s.is_empty()
    && !s.starts_with('.')
    && s
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
}

fn ensure_relative(dir: &str) -> Result<(), String> {
  let path = Path::new(dir);
  if path.is_absolute() {
    return Err(format!("'{dir}' must be relative to the source tree"));
  }
  if path.components().any(|c| matches!(c, Component::ParentDir)) {
    return Err(format!("'{dir}' must not leave the source tree"));
  }
  Ok(())
}
