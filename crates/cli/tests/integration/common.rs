//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Get path to a fixture formula directory.
pub fn fixture_path(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}

/// Isolated test environment.
///
/// Each test gets its own temporary directory with isolated root, cache and formula paths.
pub struct TestEnv {
  pub temp: TempDir,
  pub formulas: PathBuf,
}

impl TestEnv {
  /// Create from a fixture directory, copying its formulas into the temp directory.
  pub fn from_fixture(name: &str) -> Self {
    let env = Self::empty();
    for entry in std::fs::read_dir(fixture_path(name)).unwrap() {
      let entry = entry.unwrap();
      std::fs::copy(entry.path(), env.formulas.join(entry.file_name())).unwrap();
    }
    env
  }

  /// Create an environment with an empty formula directory.
  pub fn empty() -> Self {
    let temp = TempDir::new().unwrap();
    // Canonicalize so paths printed by kiln compare equal on macOS (/var -> /private/var).
    let base = dunce::canonicalize(temp.path()).unwrap();
    let formulas = base.join("formulas");
    std::fs::create_dir_all(&formulas).unwrap();
    Self { temp, formulas }
  }

  /// Write a formula descriptor into the formula directory.
  pub fn write_formula(&self, name: &str, content: &str) {
    std::fs::write(self.formulas.join(format!("{name}.toml")), content).unwrap();
  }

  /// Installation root (isolated per test).
  pub fn root(&self) -> PathBuf {
    dunce::canonicalize(self.temp.path()).unwrap().join("root")
  }

  /// Download cache (isolated per test).
  pub fn cache(&self) -> PathBuf {
    dunce::canonicalize(self.temp.path()).unwrap().join("cache")
  }

  /// Installation prefix of `name` at `version`.
  pub fn prefix(&self, name: &str, version: &str) -> PathBuf {
    self.root().join(name).join(version)
  }

  /// Get a kiln command bound to this environment's root, cache and formulas.
  pub fn kiln_cmd(&self, subcommand: &str) -> Command {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd
      .arg("--root")
      .arg(self.root())
      .arg("--cache")
      .arg(self.cache())
      .arg(subcommand)
      .arg("-f")
      .arg(&self.formulas)
      .env_remove("RUST_LOG")
      .env("TMPDIR", self.temp.path());
    cmd
  }

  /// Check whether a completion marker exists for the prefix.
  pub fn is_installed(&self, name: &str, version: &str) -> bool {
    self.prefix(name, version).join(".kiln-complete").exists()
  }

  /// Leftover build sandboxes under the temp directory.
  pub fn sandboxes(&self) -> Vec<PathBuf> {
    list_prefixed(self.temp.path(), "kiln-")
  }
}

fn list_prefixed(dir: &Path, prefix: &str) -> Vec<PathBuf> {
  std::fs::read_dir(dir)
    .unwrap()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
    .map(|e| e.path())
    .collect()
}
