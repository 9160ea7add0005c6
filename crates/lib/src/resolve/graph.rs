//! Dependency graph of a resolved plan.

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};

use crate::formula::DependencyKind;

/// Formulas of a plan and the active edges between them.
///
/// Edges point from a dependency to its dependent, so walking outgoing edges
/// visits everything that needs a formula.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
  graph: DiGraph<String, DependencyKind>,
  nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
  pub(crate) fn add_node(&mut self, name: &str) -> NodeIndex {
    if let Some(&idx) = self.nodes.get(name) {
      return idx;
    }
    let idx = self.graph.add_node(name.to_string());
    self.nodes.insert(name.to_string(), idx);
    idx
  }

  pub(crate) fn add_edge(&mut self, dependency: &str, dependent: &str, kind: DependencyKind) {
    let from = self.add_node(dependency);
    let to = self.add_node(dependent);
    self.graph.update_edge(from, to, kind);
  }

  pub fn contains(&self, name: &str) -> bool {
    self.nodes.contains_key(name)
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  /// Direct dependencies of `name` with their kind, sorted by name.
  pub fn dependencies(&self, name: &str) -> Vec<(&str, DependencyKind)> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    let mut deps: Vec<_> = self
      .graph
      .edges_directed(idx, Direction::Incoming)
      .map(|edge| (self.graph[edge.source()].as_str(), *edge.weight()))
      .collect();
    deps.sort();
    deps
  }

  /// Everything that depends on `name`, directly or transitively.
  pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
    let Some(&start) = self.nodes.get(name) else {
      return BTreeSet::new();
    };
    let mut dfs = Dfs::new(&self.graph, start);
    let mut dependents = BTreeSet::new();
    while let Some(idx) = dfs.next(&self.graph) {
      if idx != start {
        dependents.insert(self.graph[idx].clone());
      }
    }
    dependents
  }

  /// True when neither formula reaches the other.
  pub fn are_independent(&self, a: &str, b: &str) -> bool {
    match (self.nodes.get(a), self.nodes.get(b)) {
      (Some(&ia), Some(&ib)) if ia != ib => {
        !has_path_connecting(&self.graph, ia, ib, None) && !has_path_connecting(&self.graph, ib, ia, None)
      }
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn toolchain() -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    graph.add_edge("gmp", "mpfr", DependencyKind::Run);
    graph.add_edge("gmp", "avr-gcc", DependencyKind::Run);
    graph.add_edge("mpfr", "avr-gcc", DependencyKind::Run);
    graph.add_edge("avr-gcc", "avr-libc", DependencyKind::Run);
    graph.add_node("zlib");
    graph
  }

  #[test]
  fn direct_dependencies_sorted() {
    let graph = toolchain();
    assert_eq!(
      graph.dependencies("avr-gcc"),
      vec![("gmp", DependencyKind::Run), ("mpfr", DependencyKind::Run)]
    );
    assert!(graph.dependencies("gmp").is_empty());
  }

  #[test]
  fn transitive_dependents_follow_chain() {
    let graph = toolchain();
    let dependents: Vec<_> = graph.transitive_dependents("gmp").into_iter().collect();
    assert_eq!(dependents, vec!["avr-gcc", "avr-libc", "mpfr"]);
  }

  #[test]
  fn independence_query() {
    let graph = toolchain();
    assert!(graph.are_independent("zlib", "avr-libc"));
    assert!(!graph.are_independent("gmp", "avr-libc"));
    assert!(!graph.are_independent("gmp", "gmp"));
  }
}
