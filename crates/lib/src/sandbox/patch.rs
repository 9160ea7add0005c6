//! All-or-nothing application of unified diffs to an extracted source tree.
//!
//! Every patch is applied in memory first. Files are written only after all
//! hunks of all patches applied cleanly, so a rejected hunk leaves the tree
//! exactly as extracted.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PatchError {
  #[error("failed to read patch {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("patch {patch} is malformed: {message}")]
  Malformed { patch: String, message: String },

  #[error("patch {patch} targets a path outside the source tree: {path}")]
  UnsafePath { patch: String, path: String },

  #[error("patch {patch} does not apply to {file}: {message}")]
  Rejected {
    patch: String,
    file: PathBuf,
    message: String,
  },

  #[error("failed to write patched file {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Diff text ready to apply, labelled for error messages.
#[derive(Debug, Clone)]
pub struct LoadedPatch {
  pub label: String,
  pub text: String,
  pub strip: usize,
}

/// The part of a multi-file diff that touches one file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FilePatch {
  /// Path relative to the source root, after stripping.
  path: PathBuf,
  creates: bool,
  deletes: bool,
  /// Single-file diff with normalized headers.
  body: String,
}

/// Apply `patches` in order to the tree at `root`. Returns the number of files changed.
pub fn apply_all(root: &Path, patches: &[LoadedPatch]) -> Result<usize, PatchError> {
  // None marks a file deleted by an earlier patch.
  let mut staged: BTreeMap<PathBuf, Option<String>> = BTreeMap::new();

  for patch in patches {
    let files = split_file_patches(patch)?;
    debug!(patch = %patch.label, files = files.len(), "applying patch in memory");

    for file in files {
      let rejected = |message: String| PatchError::Rejected {
        patch: patch.label.clone(),
        file: file.path.clone(),
        message,
      };

      let base = match staged.get(&file.path) {
        Some(Some(content)) => content.clone(),
        Some(None) => return Err(rejected("file was deleted by an earlier patch".to_string())),
        None => {
          let on_disk = root.join(&file.path);
          match std::fs::read_to_string(&on_disk) {
            Ok(content) => {
              if file.creates {
                return Err(rejected("file to be created already exists".to_string()));
              }
              content
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && file.creates => String::new(),
            Err(e) => return Err(rejected(e.to_string())),
          }
        }
      };

      let parsed = diffy::Patch::from_str(&file.body).map_err(|e| PatchError::Malformed {
        patch: patch.label.clone(),
        message: e.to_string(),
      })?;
      let patched = diffy::apply(&base, &parsed).map_err(|e| rejected(e.to_string()))?;

      let value = if file.deletes { None } else { Some(patched) };
      staged.insert(file.path, value);
    }
  }

  for (path, content) in &staged {
    let target = root.join(path);
    let write_err = |source| PatchError::Write {
      path: target.clone(),
      source,
    };
    match content {
      Some(content) => {
        if let Some(parent) = target.parent() {
          std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(&target, content).map_err(write_err)?;
      }
      None => std::fs::remove_file(&target).map_err(write_err)?,
    }
  }

  if !patches.is_empty() {
    info!(patches = patches.len(), files = staged.len(), "patches applied");
  }
  Ok(staged.len())
}

/// Split a (possibly multi-file, `git diff` style) unified diff into per-file diffs.
///
/// Hunk line counts delimit hunks, so removed lines starting with `--` are not
/// mistaken for file headers. Lines outside hunks and headers (`diff --git`,
/// `index ...`) are dropped. Empty lines inside a hunk are treated as empty
/// context lines, which editors commonly produce by trimming trailing spaces.
fn split_file_patches(patch: &LoadedPatch) -> Result<Vec<FilePatch>, PatchError> {
  let malformed = |message: String| PatchError::Malformed {
    patch: patch.label.clone(),
    message,
  };

  let mut files = Vec::new();
  let mut current: Option<(String, String, String)> = None;
  let mut lines = patch.text.lines().peekable();
  // Remaining (old, new) lines in the current hunk.
  let mut remaining: (usize, usize) = (0, 0);

  while let Some(line) = lines.next() {
    if remaining != (0, 0) {
      let Some((_, _, body)) = current.as_mut() else {
        return Err(malformed("hunk outside of a file section".to_string()));
      };
      let line = if line.is_empty() { " " } else { line };
      match line.as_bytes()[0] {
        b' ' => {
          remaining.0 = remaining.0.saturating_sub(1);
          remaining.1 = remaining.1.saturating_sub(1);
        }
        b'-' => remaining.0 = remaining.0.saturating_sub(1),
        b'+' => remaining.1 = remaining.1.saturating_sub(1),
        b'\\' => {}
        _ => return Err(malformed(format!("unexpected line in hunk: {line}"))),
      }
      body.push_str(line);
      body.push('\n');
      continue;
    }

    if line.starts_with('\\') {
      if let Some((_, _, body)) = current.as_mut() {
        body.push_str(line);
        body.push('\n');
      }
      continue;
    }

    if let Some(old) = line.strip_prefix("--- ")
      && let Some(next) = lines.peek()
      && let Some(new) = next.strip_prefix("+++ ")
    {
      if let Some(done) = current.take() {
        files.push(finish_file(patch, done)?);
      }
      current = Some((header_path(old), header_path(new), String::new()));
      lines.next();
      continue;
    }

    if line.starts_with("@@") {
      let Some((_, _, body)) = current.as_mut() else {
        return Err(malformed("hunk before any file header".to_string()));
      };
      remaining = parse_hunk_header(line).ok_or_else(|| malformed(format!("bad hunk header: {line}")))?;
      body.push_str(line);
      body.push('\n');
    }
  }

  if remaining != (0, 0) {
    return Err(malformed("patch ends in the middle of a hunk".to_string()));
  }
  if let Some(done) = current.take() {
    files.push(finish_file(patch, done)?);
  }
  if files.is_empty() {
    return Err(malformed("no file sections found".to_string()));
  }
  Ok(files)
}

fn finish_file(patch: &LoadedPatch, (old, new, hunks): (String, String, String)) -> Result<FilePatch, PatchError> {
  let creates = old == "/dev/null";
  let deletes = new == "/dev/null";
  let name = if deletes { &old } else { &new };
  let path = strip_path(name, patch.strip).ok_or_else(|| PatchError::UnsafePath {
    patch: patch.label.clone(),
    path: name.clone(),
  })?;
  Ok(FilePatch {
    path,
    creates,
    deletes,
    body: format!("--- original\n+++ modified\n{hunks}"),
  })
}

/// File name of a `---`/`+++` header, without a trailing timestamp.
fn header_path(rest: &str) -> String {
  rest.split('\t').next().unwrap_or(rest).trim().to_string()
}

/// Drop `strip` leading components; refuse anything that escapes the tree.
fn strip_path(name: &str, strip: usize) -> Option<PathBuf> {
  let path = Path::new(name);
  if path.is_absolute() {
    return None;
  }
  let mut stripped = PathBuf::new();
  for component in path.components().skip(strip) {
    match component {
      Component::Normal(part) => stripped.push(part),
      Component::CurDir => {}
      _ => return None,
    }
  }
  (!stripped.as_os_str().is_empty()).then_some(stripped)
}

/// `@@ -a,b +c,d @@` to `(b, d)`; an omitted count is one.
fn parse_hunk_header(line: &str) -> Option<(usize, usize)> {
  let mut parts = line.split_whitespace().skip(1);
  let count = |range: &str| -> Option<usize> {
    match range.split_once(',') {
      Some((_, n)) => n.parse().ok(),
      None => Some(1),
    }
  };
  let old = count(parts.next()?.strip_prefix('-')?)?;
  let new = count(parts.next()?.strip_prefix('+')?)?;
  Some((old, new))
}
