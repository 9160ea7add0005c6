//! Formula descriptors and the set of formulas known to a run.
//!
//! A formula is one TOML file describing how to fetch, build and install a
//! single package. Formulas are loaded from a directory in file-name order,
//! which is also the declaration order the resolver uses to break ties.

mod load;
mod types;

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

pub use load::{load_dir, load_file, parse_formula};
pub use types::{
  Condition, ConfigureSpec, Dependency, DependencyKind, EnvAction, EnvRule, FinishRules, FlagSet, Formula, PatchSource,
  PatchSpec, Step, StepCommand, version_from_url, version_suffix,
};

#[derive(Debug, Error)]
pub enum FormulaError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: Box<toml::de::Error>,
  },

  #[error("invalid formula '{name}': {message}")]
  Invalid { name: String, message: String },

  #[error("formula '{name}' is declared twice ({first} and {second})")]
  Duplicate {
    name: String,
    first: PathBuf,
    second: PathBuf,
  },
}

/// Formulas available to one run, in declaration order, keyed by unique name.
#[derive(Debug, Default, Clone)]
pub struct FormulaSet {
  formulas: Vec<Formula>,
  origins: Vec<PathBuf>,
  index: HashMap<String, usize>,
}

impl FormulaSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a formula, rejecting a second formula with the same name.
  pub fn insert(&mut self, formula: Formula, origin: PathBuf) -> Result<(), FormulaError> {
    if let Some(&existing) = self.index.get(&formula.name) {
      return Err(FormulaError::Duplicate {
        name: formula.name,
        first: self.origins[existing].clone(),
        second: origin,
      });
    }
    self.index.insert(formula.name.clone(), self.formulas.len());
    self.formulas.push(formula);
    self.origins.push(origin);
    Ok(())
  }

  pub fn get(&self, name: &str) -> Option<&Formula> {
    self.index.get(name).map(|&i| &self.formulas[i])
  }

  /// Position of `name` in declaration order.
  pub fn position(&self, name: &str) -> Option<usize> {
    self.index.get(name).copied()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Formula> {
    self.formulas.iter()
  }

  pub fn len(&self) -> usize {
    self.formulas.len()
  }

  pub fn is_empty(&self) -> bool {
    self.formulas.is_empty()
  }
}

impl FromIterator<Formula> for FormulaSet {
  /// Collect formulas built in memory. Later duplicates are dropped.
  fn from_iter<I: IntoIterator<Item = Formula>>(iter: I) -> Self {
    let mut set = FormulaSet::new();
    for formula in iter {
      let origin = PathBuf::from(format!("<memory:{}>", formula.name));
      let _ = set.insert(formula, origin);
    }
    set
  }
}
