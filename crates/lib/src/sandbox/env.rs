//! Environment overlays for build subprocesses.

use std::collections::{BTreeMap, BTreeSet};

use tokio::process::Command;

/// Overrides and deletions layered over the inherited process environment.
///
/// The overlay is only ever applied to a child [`Command`]; the orchestrator's
/// own environment is never mutated, so overlays of different builds cannot
/// leak into each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
  set: BTreeMap<String, String>,
  unset: BTreeSet<String>,
}

impl EnvOverlay {
  pub fn new() -> Self {
    Self::default()
  }

  /// Set `name`, cancelling an earlier deletion of it.
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.unset.remove(&name);
    self.set.insert(name, value.into());
  }

  /// Remove `name` from the child environment, cancelling an earlier override.
  pub fn unset(&mut self, name: impl Into<String>) {
    let name = name.into();
    self.set.remove(&name);
    self.unset.insert(name);
  }

  /// Value the child will see for `name`.
  pub fn lookup(&self, name: &str) -> Option<String> {
    if self.unset.contains(name) {
      return None;
    }
    self.set.get(name).cloned().or_else(|| std::env::var(name).ok())
  }

  pub fn overrides(&self) -> impl Iterator<Item = (&str, &str)> {
    self.set.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn removals(&self) -> impl Iterator<Item = &str> {
    self.unset.iter().map(String::as_str)
  }

  pub fn apply(&self, command: &mut Command) {
    for name in &self.unset {
      command.env_remove(name);
    }
    for (name, value) in &self.set {
      command.env(name, value);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  fn later_rule_wins() {
    let mut overlay = EnvOverlay::new();
    overlay.set("AS", "/usr/bin/as");
    overlay.unset("AS");
    assert_eq!(overlay.lookup("AS"), None);

    overlay.set("AS", "/opt/cctools/bin/as");
    assert_eq!(overlay.lookup("AS").as_deref(), Some("/opt/cctools/bin/as"));
    assert_eq!(overlay.removals().count(), 0);
  }

  #[test]
  #[serial]
  fn lookup_falls_back_to_process_environment() {
    temp_env::with_var("KILN_OVERLAY_PROBE", Some("inherited"), || {
      let mut overlay = EnvOverlay::new();
      assert_eq!(overlay.lookup("KILN_OVERLAY_PROBE").as_deref(), Some("inherited"));

      overlay.unset("KILN_OVERLAY_PROBE");
      assert_eq!(overlay.lookup("KILN_OVERLAY_PROBE"), None);
      assert_eq!(std::env::var("KILN_OVERLAY_PROBE").as_deref(), Ok("inherited"));
    });
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn applied_overlay_removes_and_sets_for_child_only() {
    let mut overlay = EnvOverlay::new();
    overlay.unset("HOME");
    overlay.set("AS_FOR_TARGET", "/opt/as");

    let mut command = Command::new("/bin/sh");
    command.args(["-c", "echo \"HOME=${HOME:-unset} AS=$AS_FOR_TARGET\""]);
    overlay.apply(&mut command);
    let output = command.output().await.unwrap();

    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "HOME=unset AS=/opt/as");
    assert!(std::env::var("AS_FOR_TARGET").is_err());
  }
}
