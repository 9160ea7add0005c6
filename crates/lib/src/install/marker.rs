//! Completion markers.
//!
//! A prefix counts as installed only once its marker exists. The marker is
//! written last, so a prefix without one is the leftover of an interrupted or
//! failed build.

use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::InstallError;
use crate::consts::COMPLETE_MARKER;
use crate::formula::Formula;

const MARKER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
  Complete,
  /// Installed, but the finisher hit a naming conflict that needs manual attention.
  Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
  pub version: u32,
  pub status: MarkerStatus,
  pub formula: String,
  pub formula_version: String,
  pub installed_at_unix: u64,
}

impl CompletionMarker {
  pub fn new(formula: &Formula, status: MarkerStatus) -> Self {
    Self {
      version: MARKER_VERSION,
      status,
      formula: formula.name.clone(),
      formula_version: formula.version(),
      installed_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0),
    }
  }
}

/// Write `marker` into `prefix`.
///
/// The content goes to a temporary file in the prefix that is renamed over the
/// marker, so a reader sees either no marker or a complete one.
pub fn write_marker(prefix: &Path, marker: &CompletionMarker) -> Result<(), InstallError> {
  let path = prefix.join(COMPLETE_MARKER);
  let content = serde_json::to_string_pretty(marker).map_err(|e| InstallError::Marker {
    path: path.clone(),
    message: e.to_string(),
  })?;
  let io = |source| InstallError::Io {
    path: prefix.to_path_buf(),
    source,
  };

  let mut file = tempfile::Builder::new()
    .prefix(".kiln-marker-")
    .tempfile_in(prefix)
    .map_err(io)?;
  file.write_all(content.as_bytes()).map_err(io)?;
  file.as_file().sync_all().map_err(io)?;
  // A failed persist drops the temporary file, which deletes it.
  file.persist(&path).map_err(|e| InstallError::Io { path, source: e.error })?;
  Ok(())
}

/// Returns `None` if the marker doesn't exist.
pub fn read_marker(prefix: &Path) -> Result<Option<CompletionMarker>, InstallError> {
  let path = prefix.join(COMPLETE_MARKER);
  let content = match std::fs::read_to_string(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(source) => return Err(InstallError::Io { path, source }),
  };
  let marker = serde_json::from_str(&content).map_err(|e| InstallError::Marker {
    path: path.clone(),
    message: e.to_string(),
  })?;
  Ok(Some(marker))
}

/// Whether `prefix` holds a readable completion marker.
pub fn is_installed(prefix: &Path) -> bool {
  matches!(read_marker(prefix), Ok(Some(_)))
}
