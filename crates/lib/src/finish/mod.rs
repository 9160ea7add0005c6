//! Post-install adjustments that let several versions share a root.
//!
//! Files matching the formula's `finish.version_suffix` globs get the version
//! suffix embedded before their last extension (`libiberty.a` becomes
//! `libiberty-4.8.a`). The `info` index trees are always deleted, since they
//! would collide between versions, along with any `finish.remove` paths. Running the
//! finisher twice over the same prefix changes nothing the second time.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::consts::{COMPLETE_MARKER, INFO_TREES};
use crate::formula::Formula;

#[derive(Debug, Error)]
pub enum FinishError {
  #[error("{formula}: cannot rename {} to {}: destination already exists", .from.display(), .to.display())]
  Conflict { formula: String, from: PathBuf, to: PathBuf },

  #[error("{formula}: invalid finish pattern '{pattern}': {message}")]
  Pattern {
    formula: String,
    pattern: String,
    message: String,
  },

  #[error("finish I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// What the finisher changed, relative to the prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinishReport {
  pub renamed: Vec<(PathBuf, PathBuf)>,
  pub removed: Vec<PathBuf>,
  /// Matches that already carried the suffix.
  pub already_suffixed: usize,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
  case_sensitive: true,
  require_literal_separator: true,
  require_literal_leading_dot: false,
};

/// Apply `formula`'s finish rules to the installed `prefix`.
pub fn finish(formula: &Formula, prefix: &Path) -> Result<FinishReport, FinishError> {
  let mut report = FinishReport::default();
  let io = |path: &Path| {
    let path = path.to_path_buf();
    move |source| FinishError::Io { path, source }
  };

  let patterns = compile_patterns(formula)?;
  match formula.version_suffix() {
    Some(suffix) if !patterns.is_empty() => {
      for relative in matching_files(prefix, &patterns) {
        let Some(renamed) = suffixed_name(&relative, &suffix) else {
          report.already_suffixed += 1;
          continue;
        };
        let from = prefix.join(&relative);
        let to = prefix.join(&renamed);
        if to.symlink_metadata().is_ok() {
          return Err(FinishError::Conflict {
            formula: formula.name.clone(),
            from,
            to,
          });
        }
        std::fs::rename(&from, &to).map_err(io(&from))?;
        debug!(from = ?relative, to = ?renamed, "added version suffix");
        report.renamed.push((relative, renamed));
      }
    }
    None if !patterns.is_empty() => {
      debug!(formula = %formula.name, "no version suffix, skipping renames");
    }
    _ => {}
  }

  let mut seen = BTreeSet::new();
  let entries = INFO_TREES.iter().copied().chain(formula.finish.remove.iter().map(String::as_str));
  for entry in entries {
    let relative = checked_relative(formula, entry)?;
    if !seen.insert(relative.clone()) {
      continue;
    }
    let target = prefix.join(&relative);
    let Ok(metadata) = target.symlink_metadata() else {
      continue;
    };
    if metadata.is_dir() {
      std::fs::remove_dir_all(&target).map_err(io(&target))?;
    } else {
      std::fs::remove_file(&target).map_err(io(&target))?;
    }
    report.removed.push(relative);
  }

  info!(
    formula = %formula.name,
    renamed = report.renamed.len(),
    removed = report.removed.len(),
    "finished install"
  );
  Ok(report)
}

fn compile_patterns(formula: &Formula) -> Result<Vec<Pattern>, FinishError> {
  formula
    .finish
    .version_suffix
    .iter()
    .map(|glob| {
      checked_relative(formula, glob)?;
      Pattern::new(glob).map_err(|e| FinishError::Pattern {
        formula: formula.name.clone(),
        pattern: glob.clone(),
        message: e.to_string(),
      })
    })
    .collect()
}

/// `entry` as a path that cannot leave the prefix.
pub(crate) fn checked_relative(formula: &Formula, entry: &str) -> Result<PathBuf, FinishError> {
  let path = Path::new(entry);
  let escapes = path.is_absolute()
    || path
      .components()
      .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
  if escapes || entry.is_empty() {
    return Err(FinishError::Pattern {
      formula: formula.name.clone(),
      pattern: entry.to_string(),
      message: "must be relative to the prefix and stay inside it".to_string(),
    });
  }
  Ok(path.to_path_buf())
}

/// Files (and symlinks, which are never followed) under `prefix` matching any pattern.
fn matching_files(prefix: &Path, patterns: &[Pattern]) -> BTreeSet<PathBuf> {
  WalkDir::new(prefix)
    .follow_links(false)
    .into_iter()
    .filter_map(Result::ok)
    .filter(|entry| !entry.file_type().is_dir())
    .filter_map(|entry| entry.path().strip_prefix(prefix).ok().map(Path::to_path_buf))
    .filter(|relative| relative.as_os_str() != COMPLETE_MARKER)
    .filter(|relative| patterns.iter().any(|p| p.matches_path_with(relative, MATCH_OPTIONS)))
    .collect()
}

/// `relative` with `-<suffix>` inserted before the last extension, or `None` if already there.
fn suffixed_name(relative: &Path, suffix: &str) -> Option<PathBuf> {
  let name = relative.file_name()?.to_str()?;
  let (stem, extension) = match name.rfind('.') {
    Some(0) | None => (name, ""),
    Some(index) => name.split_at(index),
  };
  let marker = format!("-{suffix}");
  if stem.ends_with(&marker) {
    return None;
  }
  Some(relative.with_file_name(format!("{stem}{marker}{extension}")))
}
