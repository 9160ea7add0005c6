//! Source archive extraction.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::read::GzDecoder;
use tracing::debug;
use xz2::read::XzDecoder;

use super::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
  Tar,
  TarGz,
  TarXz,
  /// Handed to the system `tar`.
  External(&'static str),
  /// Not an archive; copied into the source directory as-is.
  Plain,
}

impl ArchiveFormat {
  fn detect(path: &Path) -> Self {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
      Self::TarGz
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
      Self::TarXz
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
      Self::External("-xjf")
    } else if name.ends_with(".tar.zst") {
      Self::External("--zstd")
    } else if name.ends_with(".tar") {
      Self::Tar
    } else {
      Self::Plain
    }
  }
}

/// Extract `archive` into `dest` and return the source root.
///
/// An archive holding a single top-level directory has that directory as its
/// source root; anything else is rooted at `dest`.
pub fn extract(archive: &Path, dest: &Path) -> Result<PathBuf, SandboxError> {
  std::fs::create_dir_all(dest).map_err(SandboxError::io(dest))?;
  let format = ArchiveFormat::detect(archive);
  debug!(archive = ?archive, dest = ?dest, format = ?format, "extracting source");

  let fail = |message: String| SandboxError::Extract {
    archive: archive.to_path_buf(),
    message,
  };

  match format {
    ArchiveFormat::Tar => unpack(File::open(archive).map_err(SandboxError::io(archive))?, dest).map_err(&fail)?,
    ArchiveFormat::TarGz => unpack(GzDecoder::new(open_buffered(archive)?), dest).map_err(&fail)?,
    ArchiveFormat::TarXz => unpack(XzDecoder::new(open_buffered(archive)?), dest).map_err(&fail)?,
    ArchiveFormat::External(flag) => {
      let mut command = Command::new("tar");
      if flag == "--zstd" {
        command.args(["--zstd", "-xf"]);
      } else {
        command.arg(flag);
      }
      let output = command
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .map_err(|e| fail(format!("failed to run tar: {e}")))?;
      if !output.status.success() {
        return Err(fail(String::from_utf8_lossy(&output.stderr).trim().to_string()));
      }
    }
    ArchiveFormat::Plain => {
      let name = archive.file_name().ok_or_else(|| fail("source has no file name".to_string()))?;
      let target = dest.join(name);
      std::fs::copy(archive, &target).map_err(SandboxError::io(&target))?;
    }
  }

  source_root(dest)
}

fn open_buffered(path: &Path) -> Result<BufReader<File>, SandboxError> {
  Ok(BufReader::new(File::open(path).map_err(SandboxError::io(path))?))
}

fn unpack<R: Read>(reader: R, dest: &Path) -> Result<(), String> {
  let mut archive = tar::Archive::new(reader);
  archive.set_preserve_mtime(true);
  archive.unpack(dest).map_err(|e| e.to_string())
}

fn source_root(dest: &Path) -> Result<PathBuf, SandboxError> {
  let mut entries = std::fs::read_dir(dest)
    .map_err(SandboxError::io(dest))?
    .filter_map(Result::ok)
    .collect::<Vec<_>>();

  if entries.len() == 1
    && entries[0].file_type().map(|t| t.is_dir()).unwrap_or(false)
    && let Some(entry) = entries.pop()
  {
    return Ok(entry.path());
  }
  Ok(dest.to_path_buf())
}
