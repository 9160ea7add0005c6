//! Dependency resolution.
//!
//! Turns the requested targets into an install plan:
//! 1. Conditional dependencies are evaluated against the run's flags and host
//!    platform; a false condition drops the edge entirely.
//! 2. A depth-first, post-order walk over the transitive closure orders every
//!    dependency before its dependents, detecting cycles with a per-node
//!    "visiting" mark and missing formulas as they are reached.
//! 3. Formulas already installed keep only their run-time edges, so build-only
//!    dependencies of an installed formula drop out of the plan.
//!
//! Nothing here touches the filesystem or the network, so a failed resolution
//! leaves no side effects behind.

mod graph;

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::formula::{DependencyKind, EnvAction, FlagSet, Formula, FormulaSet, StepCommand};
use crate::placeholder::{self, PlaceholderError};
use crate::platform::Platform;

pub use graph::DependencyGraph;

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("dependency cycle: {}", .cycle.join(" -> "))]
  Cycle { cycle: Vec<String> },

  #[error("formula '{formula}' depends on '{dependency}', which is not defined")]
  MissingDependency { formula: String, dependency: String },

  #[error("unknown target '{0}'")]
  UnknownTarget(String),

  #[error("formula '{formula}': {source}")]
  Placeholder {
    formula: String,
    #[source]
    source: PlaceholderError,
  },
}

/// Inputs that decide which conditional edges exist.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
  pub flags: FlagSet,
  pub platform: Platform,
  /// Names of formulas whose prefix already carries a completion marker.
  pub installed: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
  Pending,
  Installed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
  pub name: String,
  pub version: String,
  pub status: PlanStatus,
}

/// An install plan and the graph it was derived from.
#[derive(Debug, Clone)]
pub struct Resolution {
  /// Every dependency precedes its dependents.
  pub order: Vec<PlanEntry>,
  pub graph: DependencyGraph,
}

impl Resolution {
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.order.iter().map(|e| e.name.as_str())
  }

  pub fn pending(&self) -> impl Iterator<Item = &PlanEntry> {
    self.order.iter().filter(|e| e.status == PlanStatus::Pending)
  }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
  Visiting,
  Done,
}

struct Walk<'a> {
  formulas: &'a FormulaSet,
  ctx: &'a ResolveContext,
  marks: HashMap<&'a str, Mark>,
  stack: Vec<&'a str>,
  post_order: Vec<&'a str>,
  edges: HashMap<&'a str, Vec<(&'a str, DependencyKind)>>,
}

impl<'a> Walk<'a> {
  /// Active dependencies of `formula`, in declaration order of the formula set.
  fn active_edges(&self, formula: &'a Formula) -> Result<Vec<(&'a str, DependencyKind)>, ResolveError> {
    let mut edges: Vec<(&'a str, DependencyKind)> = Vec::new();
    for dep in formula.active_dependencies(&self.ctx.flags, &self.ctx.platform) {
      let Some(target) = self.formulas.get(&dep.name) else {
        return Err(ResolveError::MissingDependency {
          formula: formula.name.clone(),
          dependency: dep.name.clone(),
        });
      };
      match edges.iter_mut().find(|(name, _)| *name == target.name) {
        // Declared twice under different conditions: run-time wins.
        Some(existing) => existing.1 = existing.1.max(dep.kind),
        None => edges.push((target.name.as_str(), dep.kind)),
      }
    }
    edges.sort_by_key(|(name, _)| self.formulas.position(name));
    Ok(edges)
  }

  fn visit(&mut self, name: &'a str) -> Result<(), ResolveError> {
    match self.marks.get(name) {
      Some(Mark::Done) => return Ok(()),
      Some(Mark::Visiting) => {
        let start = self.stack.iter().position(|n| *n == name).unwrap_or(0);
        let mut cycle: Vec<String> = self.stack[start..].iter().map(|s| s.to_string()).collect();
        cycle.push(name.to_string());
        return Err(ResolveError::Cycle { cycle });
      }
      None => {}
    }

    let Some(formula) = self.formulas.get(name) else {
      return Err(ResolveError::UnknownTarget(name.to_string()));
    };

    self.marks.insert(name, Mark::Visiting);
    self.stack.push(name);

    let edges = self.active_edges(formula)?;
    check_formula_references(formula, &edges, self.ctx)?;
    for &(dep, _) in &edges {
      self.visit(dep)?;
    }

    self.stack.pop();
    self.marks.insert(name, Mark::Done);
    self.post_order.push(name);
    self.edges.insert(name, edges);
    Ok(())
  }
}

/// Compute the install plan for `targets`.
///
/// Fails before any side effect with [`ResolveError::Cycle`] or
/// [`ResolveError::MissingDependency`] (unknown targets included).
pub fn resolve(formulas: &FormulaSet, targets: &[String], ctx: &ResolveContext) -> Result<Resolution, ResolveError> {
  let mut roots: Vec<&str> = Vec::new();
  for target in targets {
    let Some(formula) = formulas.get(target) else {
      return Err(ResolveError::UnknownTarget(target.clone()));
    };
    if !roots.contains(&formula.name.as_str()) {
      roots.push(formula.name.as_str());
    }
  }
  roots.sort_by_key(|name| formulas.position(name));

  let mut walk = Walk {
    formulas,
    ctx,
    marks: HashMap::new(),
    stack: Vec::new(),
    post_order: Vec::new(),
    edges: HashMap::new(),
  };
  for &root in &roots {
    walk.visit(root)?;
  }

  // Installed formulas only pull in what they need at run time.
  let mut required: HashSet<&str> = HashSet::new();
  let mut queue: Vec<&str> = roots.clone();
  while let Some(name) = queue.pop() {
    if !required.insert(name) {
      continue;
    }
    let installed = ctx.installed.contains(name);
    for &(dep, kind) in walk.edges.get(name).into_iter().flatten() {
      if !installed || kind == DependencyKind::Run {
        queue.push(dep);
      }
    }
  }

  let mut graph = DependencyGraph::default();
  let mut order = Vec::new();
  for &name in walk.post_order.iter().filter(|n| required.contains(*n)) {
    graph.add_node(name);
    for &(dep, kind) in walk.edges.get(name).into_iter().flatten() {
      if required.contains(dep) {
        graph.add_edge(dep, name, kind);
      }
    }
    let status = if ctx.installed.contains(name) {
      PlanStatus::Installed
    } else {
      PlanStatus::Pending
    };
    let version = formulas.get(name).map(Formula::version).unwrap_or_default();
    debug!(formula = %name, version = %version, status = ?status, "planned");
    order.push(PlanEntry {
      name: name.to_string(),
      version,
      status,
    });
  }

  info!(
    targets = roots.len(),
    planned = order.len(),
    pending = order.iter().filter(|e| e.status == PlanStatus::Pending).count(),
    "resolved install plan"
  );

  Ok(Resolution { order, graph })
}

/// `$${formula:X}` in an active rule or step requires `X` to be an active dependency.
fn check_formula_references(
  formula: &Formula,
  edges: &[(&str, DependencyKind)],
  ctx: &ResolveContext,
) -> Result<(), ResolveError> {
  let mut strings: Vec<&str> = Vec::new();
  for rule in formula.active_env(&ctx.flags, &ctx.platform) {
    if let EnvAction::Set(value) = &rule.action {
      strings.push(value);
    }
  }
  if let Some(configure) = &formula.configure {
    strings.extend(configure.args.iter().map(String::as_str));
  }
  for step in &formula.steps {
    match &step.command {
      StepCommand::Program { program, args } => {
        strings.push(program);
        strings.extend(args.iter().map(String::as_str));
      }
      StepCommand::Shell(script) => strings.push(script),
    }
  }

  for s in strings {
    let refs = placeholder::formula_references(s).map_err(|source| ResolveError::Placeholder {
      formula: formula.name.clone(),
      source,
    })?;
    for name in refs {
      if !edges.iter().any(|(dep, _)| *dep == name) {
        return Err(ResolveError::MissingDependency {
          formula: formula.name.clone(),
          dependency: name,
        });
      }
    }
  }
  Ok(())
}
