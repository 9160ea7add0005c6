//! Source fetching with mirror fallback and a checksum-keyed cache.
//!
//! Each source is identified by its declared checksum. A fetch:
//! 1. takes the per-checksum cache lock, so a single writer exists per source;
//! 2. reuses `<cache>/sources/<algo>-<hex>/<file>` when it still verifies;
//! 3. otherwise downloads the primary URL once, then the mirror once;
//! 4. verifies the bytes before anything is written, and moves the file into
//!    place through a `.part` file so a cache entry is always complete.
//!
//! A checksum mismatch is final: the mirror is not consulted and nothing is
//! cached for that checksum.

pub mod checksum;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::lock::{FileLock, LockError};

pub use checksum::{Checksum, ChecksumParseError, HashAlgorithm};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("failed to fetch {url}: {}", .attempts.join("; "))]
  Unreachable { url: String, attempts: Vec<String> },

  #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
  ChecksumMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("cache I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to create HTTP client: {0}")]
  Client(#[source] reqwest::Error),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("cache lock task failed: {0}")]
  Task(String),
}

impl FetchError {
  fn io(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Something that turns a source declaration into a verified local file.
pub trait SourceFetch: Send + Sync {
  fn fetch(
    &self,
    url: &str,
    mirror: Option<&str>,
    checksum: &Checksum,
  ) -> impl Future<Output = Result<PathBuf, FetchError>> + Send;
}

/// Fetches over HTTP(S) or from `file://` URLs into the source cache.
#[derive(Debug, Clone)]
pub struct Fetcher {
  client: reqwest::Client,
  cache_dir: PathBuf,
}

impl Fetcher {
  pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, FetchError> {
    Self::with_timeout(cache_dir, DEFAULT_TIMEOUT)
  }

  pub fn with_timeout(cache_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(FetchError::Client)?;
    Ok(Self {
      client,
      cache_dir: cache_dir.into(),
    })
  }

  /// Directory holding the cache entry for `checksum`.
  pub fn entry_dir(&self, checksum: &Checksum) -> PathBuf {
    self.cache_dir.join("sources").join(checksum.cache_key())
  }

  /// Cached file for `checksum`, if one exists. Does not verify it.
  pub fn cached_path(&self, url: &str, checksum: &Checksum) -> Option<PathBuf> {
    let path = self.entry_dir(checksum).join(url_to_filename(url));
    path.is_file().then_some(path)
  }

  async fn lock_entry(&self, checksum: &Checksum) -> Result<FileLock, FetchError> {
    let lock_path = self
      .cache_dir
      .join("sources")
      .join(format!("{}.lock", checksum.cache_key()));
    tokio::task::spawn_blocking(move || FileLock::acquire_blocking(&lock_path))
      .await
      .map_err(|e| FetchError::Task(e.to_string()))?
      .map_err(FetchError::from)
  }

  async fn download(&self, url: &str) -> Result<Vec<u8>, String> {
    if let Some(path) = url.strip_prefix("file://") {
      return fs::read(path).await.map_err(|e| e.to_string());
    }

    let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
      return Err(format!("HTTP {}", response.status()));
    }
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    Ok(bytes.to_vec())
  }

  async fn store(&self, dest: &Path, bytes: &[u8]) -> Result<(), FetchError> {
    let Some(dir) = dest.parent() else {
      return Err(FetchError::Task(format!("cache path {} has no parent", dest.display())));
    };
    fs::create_dir_all(dir).await.map_err(FetchError::io(dir))?;

    let part = dest.with_extension("part");
    let result = match write_part(&part, bytes).await {
      Ok(()) => fs::rename(&part, dest).await.map_err(FetchError::io(dest)),
      Err(e) => Err(e),
    };
    if result.is_err()
      && let Err(e) = fs::remove_file(&part).await
      && e.kind() != std::io::ErrorKind::NotFound
    {
      warn!(path = ?part, error = %e, "failed to remove partial download");
    }
    result
  }
}

async fn write_part(part: &Path, bytes: &[u8]) -> Result<(), FetchError> {
  let mut file = fs::File::create(part).await.map_err(FetchError::io(part))?;
  file.write_all(bytes).await.map_err(FetchError::io(part))?;
  file.flush().await.map_err(FetchError::io(part))?;
  file.sync_all().await.map_err(FetchError::io(part))
}

impl SourceFetch for Fetcher {
  async fn fetch(&self, url: &str, mirror: Option<&str>, checksum: &Checksum) -> Result<PathBuf, FetchError> {
    let _lock = self.lock_entry(checksum).await?;
    let dest = self.entry_dir(checksum).join(url_to_filename(url));

    if dest.is_file() {
      let bytes = fs::read(&dest).await.map_err(FetchError::io(&dest))?;
      if checksum.verify(&bytes) {
        info!(url = %url, path = ?dest, "using cached source");
        return Ok(dest);
      }
      warn!(path = ?dest, "cached source no longer matches its checksum, re-fetching");
      fs::remove_file(&dest).await.map_err(FetchError::io(&dest))?;
    }

    let mut attempts = Vec::new();
    for candidate in std::iter::once(url).chain(mirror) {
      info!(url = %candidate, "fetching source");
      let bytes = match self.download(candidate).await {
        Ok(bytes) => bytes,
        Err(message) => {
          warn!(url = %candidate, error = %message, "fetch attempt failed");
          attempts.push(format!("{candidate}: {message}"));
          continue;
        }
      };

      let actual = Checksum::of_bytes(checksum.algorithm(), &bytes);
      if actual.hex() != checksum.hex() {
        return Err(FetchError::ChecksumMismatch {
          url: candidate.to_string(),
          expected: checksum.to_string(),
          actual: actual.to_string(),
        });
      }

      self.store(&dest, &bytes).await?;
      info!(url = %candidate, path = ?dest, size = bytes.len(), "source verified and cached");
      return Ok(dest);
    }

    debug!(url = %url, attempts = attempts.len(), "all sources failed");
    Err(FetchError::Unreachable {
      url: url.to_string(),
      attempts,
    })
  }
}

/// Convert a URL to a safe filename.
///
/// Takes the last path component and sanitizes it. Falls back to a hash of
/// the URL if no suitable filename can be extracted.
pub fn url_to_filename(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split(['?', '#']).next().unwrap_or(filename);

    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  let digest = hex::encode(Sha256::digest(url.as_bytes()));
  format!("download_{}", &digest[..16])
}
