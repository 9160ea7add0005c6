mod fetch;
mod install;
mod plan;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use kiln_lib::formula::{FormulaSet, load_dir};
use kiln_lib::install::InstallConfig;

use crate::output;

pub use fetch::cmd_fetch;
pub use install::{InstallOptions, cmd_install};
pub use plan::cmd_plan;

/// Settings shared by every command that works on a formula directory.
#[derive(Debug, Clone)]
pub struct CommonOptions {
  pub root: Option<PathBuf>,
  pub cache: Option<PathBuf>,
  pub formulas: PathBuf,
  pub targets: Vec<String>,
  pub flags: Vec<String>,
  pub json: bool,
}

impl CommonOptions {
  /// Install configuration: library defaults, overridden by command-line flags.
  pub fn config(&self) -> InstallConfig {
    let mut config = InstallConfig::default();
    if let Some(root) = &self.root {
      config.root = root.clone();
    }
    if let Some(cache) = &self.cache {
      config.cache = cache.clone();
    }
    config.flags = self.flags.iter().cloned().collect();
    config
  }

  pub fn load(&self) -> Result<FormulaSet> {
    load_formulas(&self.formulas, &self.flags)
  }
}

fn load_formulas(dir: &Path, flags: &[String]) -> Result<FormulaSet> {
  let formulas =
    load_dir(dir).with_context(|| format!("Failed to load formulas from {}", dir.display()))?;

  for flag in flags {
    if !formulas.iter().any(|f| f.feature_flags.contains_key(flag)) {
      output::caution(&format!("No formula declares the feature flag '{}'", flag));
    }
  }

  Ok(formulas)
}
