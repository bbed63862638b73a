// src/resolver/graph.rs

//! Resolution graph: the target state as a DAG
//!
//! Nodes live in a flat arena and refer to each other by position. An edge
//! `a -> b` means `a` depends on `b`. Removed packages stay in the graph with
//! the edges from their installed record so the planner can order removals.

use crate::error::{Error, Result};
use crate::index::{Package, PackageId};
use crate::state::InstalledRecord;
use crate::version::PackageVersion;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// What happens to a package in the target state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Keep,
    Upgrade,
    Downgrade,
    Remove,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Keep => "keep",
            Action::Upgrade => "upgrade",
            Action::Downgrade => "downgrade",
            Action::Remove => "remove",
        }
    }

    /// Install, upgrade or downgrade: new files land on disk
    pub fn is_install_side(&self) -> bool {
        matches!(self, Action::Install | Action::Upgrade | Action::Downgrade)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resolved package
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    /// Target version; for removals, the installed version
    pub version: PackageVersion,
    pub action: Action,
    /// Package being installed (install-side actions only)
    pub package: Option<Package>,
    /// Current record, for anything already installed
    pub installed: Option<InstalledRecord>,
    /// Explicit flag in the target state
    pub explicit: bool,
    /// Explicit flag flips from false to true
    pub promote: bool,
    /// Arena positions of the packages this one depends on
    pub dependencies: Vec<usize>,
}

impl Node {
    pub fn id(&self) -> PackageId {
        PackageId::new(self.name.clone(), self.version.clone())
    }

    pub fn is_removed(&self) -> bool {
        self.action == Action::Remove
    }

    /// Whether the node changes anything on disk or in the store
    pub fn is_change(&self) -> bool {
        self.action != Action::Keep || self.promote
    }
}

/// Resolved target state
#[derive(Debug, Clone, Default)]
pub struct ResolutionGraph {
    nodes: Vec<Node>,
    by_name: BTreeMap<String, usize>,
    orphans: Vec<String>,
    generation: i64,
}

impl ResolutionGraph {
    /// Empty graph planned against the given state generation
    pub fn new(generation: i64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    /// Add a node without edges; returns its position
    ///
    /// Names are unique: adding a name twice is an error.
    pub fn add_node(&mut self, node: Node) -> Result<usize> {
        if self.by_name.contains_key(&node.name) {
            return Err(Error::InvalidRequest(format!(
                "package {} resolved twice",
                node.name
            )));
        }
        let idx = self.nodes.len();
        self.by_name.insert(node.name.clone(), idx);
        self.nodes.push(node);
        Ok(idx)
    }

    /// Record that `from` depends on `to`
    pub fn add_edge(&mut self, from: usize, to: usize) {
        if let Some(node) = self.nodes.get_mut(from) {
            if !node.dependencies.contains(&to) {
                node.dependencies.push(to);
            }
        }
    }

    pub fn set_orphans(&mut self, orphans: Vec<String>) {
        self.orphans = orphans;
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.index_of(name).map(|idx| &self.nodes[idx])
    }

    /// Non-explicit packages proposed for removal; never applied
    pub fn orphans(&self) -> &[String] {
        &self.orphans
    }

    /// State generation the graph was resolved against
    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether applying the graph would change anything
    pub fn has_changes(&self) -> bool {
        self.nodes.iter().any(Node::is_change)
    }

    /// Nodes that change something, in name order
    pub fn changes(&self) -> impl Iterator<Item = &Node> {
        self.by_name
            .values()
            .map(|&idx| &self.nodes[idx])
            .filter(|n| n.is_change())
    }

    /// Positions of the nodes depending on `idx`
    pub fn dependents(&self, idx: usize) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.dependencies.contains(&idx))
            .map(|(i, _)| i)
            .collect()
    }

    /// Reject dependency cycles
    ///
    /// Iterative depth-first search with white/grey/black marks. The error
    /// lists the cycle starting and ending at the same package.
    pub fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let mut marks = vec![Mark::White; self.nodes.len()];

        for &start in self.by_name.values() {
            if marks[start] != Mark::White {
                continue;
            }

            // (node, next edge to follow)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::Grey;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let deps = &self.nodes[node].dependencies;
                if top.1 < deps.len() {
                    let next = deps[top.1];
                    top.1 += 1;
                    match marks[next] {
                        Mark::White => {
                            marks[next] = Mark::Grey;
                            stack.push((next, 0));
                        }
                        Mark::Grey => {
                            let pos = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                            let mut cycle: Vec<String> = stack[pos..]
                                .iter()
                                .map(|&(n, _)| self.nodes[n].name.clone())
                                .collect();
                            cycle.push(self.nodes[next].name.clone());
                            return Err(Error::CyclicDependency { cycle });
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks[node] = Mark::Black;
                    stack.pop();
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, action: Action) -> Node {
        Node {
            name: name.to_string(),
            version: PackageVersion::parse("1.0").unwrap(),
            action,
            package: None,
            installed: None,
            explicit: false,
            promote: false,
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn test_names_are_unique() {
        let mut graph = ResolutionGraph::new(0);
        graph.add_node(node("a", Action::Install)).unwrap();
        assert!(graph.add_node(node("a", Action::Keep)).is_err());
    }

    #[test]
    fn test_acyclic_graph_passes() {
        let mut graph = ResolutionGraph::new(0);
        let a = graph.add_node(node("a", Action::Install)).unwrap();
        let b = graph.add_node(node("b", Action::Install)).unwrap();
        let c = graph.add_node(node("c", Action::Install)).unwrap();
        graph.add_edge(b, a);
        graph.add_edge(c, a);
        graph.add_edge(c, b);

        graph.check_acyclic().unwrap();
        assert_eq!(graph.dependents(a), vec![b, c]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut graph = ResolutionGraph::new(0);
        let a = graph.add_node(node("a", Action::Install)).unwrap();
        let b = graph.add_node(node("b", Action::Install)).unwrap();
        let c = graph.add_node(node("c", Action::Install)).unwrap();
        graph.add_edge(a, b);
        graph.add_edge(b, c);
        graph.add_edge(c, a);

        match graph.check_acyclic() {
            Err(Error::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_keep_without_promotion_is_not_a_change() {
        let mut graph = ResolutionGraph::new(3);
        graph.add_node(node("a", Action::Keep)).unwrap();
        assert!(!graph.has_changes());

        let mut promoted = node("b", Action::Keep);
        promoted.promote = true;
        graph.add_node(promoted).unwrap();
        assert!(graph.has_changes());
        assert_eq!(graph.changes().count(), 1);
        assert_eq!(graph.generation(), 3);
    }
}
