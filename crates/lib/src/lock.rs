//! File-based locking for the installation root and the download cache.
//!
//! Two kinds of lock are used:
//! - the root lock, taken without blocking by an install run so two installers
//!   never mutate the same root. Contention is reported with the holder's
//!   metadata.
//! - per-checksum cache locks, taken blocking so concurrent fetches of the same
//!   source serialize on a single writer.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::ROOT_LOCK_FILENAME;

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error(
    "installation root is locked by another process: {command} (PID {pid}, started {started_at})\n\
     If you're sure no kiln process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    started_at: String,
    lock_path: PathBuf,
  },

  #[error(
    "installation root is locked (could not read lock metadata)\n\
     If you're sure no kiln process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open lock file {path}: {source}")]
  OpenFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// An exclusive lock held for as long as the value lives.
#[derive(Debug)]
pub struct FileLock {
  file: File,
  lock_path: PathBuf,
}

impl FileLock {
  /// Take the installation-root lock without waiting.
  ///
  /// Fails with [`LockError::Contention`] when another process holds it.
  pub fn acquire_root(root: &Path, command: &str) -> Result<Self, LockError> {
    let lock_path = root.join(ROOT_LOCK_FILENAME);
    let file = open_lock_file(&lock_path)?;

    if let Err(err) = try_lock(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(read_contention_error(&lock_path));
      }
      return Err(LockError::LockFailed(err));
    }

    write_metadata(&file, command, root)?;
    debug!(path = ?lock_path, "acquired root lock");

    Ok(FileLock { file, lock_path })
  }

  /// Take an exclusive lock on `lock_path`, waiting for the current holder.
  ///
  /// This blocks the calling thread; async callers run it on the blocking pool.
  pub fn acquire_blocking(lock_path: &Path) -> Result<Self, LockError> {
    let file = open_lock_file(lock_path)?;
    lock_blocking(&file).map_err(LockError::LockFailed)?;
    Ok(FileLock {
      file,
      lock_path: lock_path.to_path_buf(),
    })
  }

  /// Reads the lock metadata from the held file handle.
  ///
  /// Opening a second handle would fail on Windows while the lock is held.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn open_lock_file(lock_path: &Path) -> Result<File, LockError> {
  if let Some(parent) = lock_path.parent()
    && !parent.exists()
  {
    std::fs::create_dir_all(parent).map_err(|source| LockError::CreateDir {
      path: parent.to_path_buf(),
      source,
    })?;
  }

  OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(lock_path)
    .map_err(|source| LockError::OpenFile {
      path: lock_path.to_path_buf(),
      source,
    })
}

fn write_metadata(file: &File, command: &str, root: &Path) -> Result<(), LockError> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    root: root.to_path_buf(),
  };

  file.set_len(0).map_err(LockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(LockError::WriteMetadata)?;

  Ok(())
}

fn read_contention_error(lock_path: &Path) -> LockError {
  if let Ok(mut file) = File::open(lock_path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
      return LockError::Contention {
        command: metadata.command,
        pid: metadata.pid,
        started_at: format!("Unix timestamp {}", metadata.started_at_unix),
        lock_path: lock_path.to_path_buf(),
      };
    }
  }

  LockError::ContentionUnknown {
    lock_path: lock_path.to_path_buf(),
  }
}

#[cfg(unix)]
fn flock_exclusive(file: &File, blocking: bool) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = if blocking {
    FlockOperation::LockExclusive
  } else {
    FlockOperation::NonBlockingLockExclusive
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn flock_exclusive(file: &File, blocking: bool) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = if blocking {
    LOCKFILE_EXCLUSIVE_LOCK
  } else {
    LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK
  };

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}

fn try_lock(file: &File) -> io::Result<()> {
  flock_exclusive(file, false)
}

fn lock_blocking(file: &File) -> io::Result<()> {
  flock_exclusive(file, true)
}
