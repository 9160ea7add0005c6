//! Test utilities for kiln-lib.
//!
//! Helpers for tests that need real source archives on disk or a fetcher
//! that records how often it was asked for something.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::fetch::{Checksum, FetchError, HashAlgorithm, SourceFetch};

/// Writes `<dir>/<name>.tar.gz` containing `entries` and returns its path and checksum.
pub fn source_tarball(dir: &Path, name: &str, entries: &[(&str, &str)]) -> (PathBuf, String) {
  std::fs::create_dir_all(dir).unwrap();
  let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
  for (path, contents) in entries {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, path, contents.as_bytes()).unwrap();
  }
  let bytes = builder.into_inner().unwrap().finish().unwrap();

  let archive = dir.join(format!("{name}.tar.gz"));
  std::fs::write(&archive, &bytes).unwrap();
  (archive, Checksum::of_bytes(HashAlgorithm::Sha256, &bytes).to_string())
}

/// `file://` URL for a local path.
pub fn file_url(path: &Path) -> String {
  format!("file://{}", path.display())
}

/// A fetcher that never succeeds and counts its calls.
#[derive(Debug, Default)]
pub struct CountingFetcher {
  calls: AtomicUsize,
}

impl CountingFetcher {
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl SourceFetch for CountingFetcher {
  async fn fetch(&self, url: &str, _mirror: Option<&str>, _checksum: &Checksum) -> Result<PathBuf, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    Err(FetchError::Unreachable {
      url: url.to_string(),
      attempts: vec!["counting fetcher never fetches".to_string()],
    })
  }
}
