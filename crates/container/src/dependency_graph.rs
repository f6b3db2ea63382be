//! Dependency graph between component names, recorded as wiring resolves
//! dependencies. Drives teardown order: a component is destroyed before the
//! components it depends on.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct Edges {
    /// from -> to
    forward: HashMap<String, Vec<String>>,
    /// to <- from
    reverse: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: RwLock<Edges>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `from` depends on `to`
    pub fn add_dependency(&self, from: &str, to: &str) {
        if from == to {
            return;
        }
        let mut edges = self.edges.write();
        let targets = edges.forward.entry(from.to_string()).or_default();
        if targets.iter().any(|t| t == to) {
            return;
        }
        targets.push(to.to_string());
        edges
            .reverse
            .entry(to.to_string())
            .or_default()
            .push(from.to_string());
        debug!("Dependency recorded: {} -> {}", from, to);
    }

    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.edges
            .read()
            .forward
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.edges
            .read()
            .reverse
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn dependency_count(&self) -> usize {
        self.edges.read().forward.values().map(Vec::len).sum()
    }

    /// Drop every edge touching `name`
    pub fn remove(&self, name: &str) {
        let mut edges = self.edges.write();
        if let Some(targets) = edges.forward.remove(name) {
            for target in targets {
                if let Some(sources) = edges.reverse.get_mut(&target) {
                    sources.retain(|s| s != name);
                }
            }
        }
        if let Some(sources) = edges.reverse.remove(name) {
            for source in sources {
                if let Some(targets) = edges.forward.get_mut(&source) {
                    targets.retain(|t| t != name);
                }
            }
        }
    }

    /// Order in which to destroy `live` components (given in creation
    /// order): dependents first, then their dependencies. When the remaining
    /// components form a cycle, falls back to reverse creation order.
    pub fn teardown_order(&self, live: &[String]) -> Vec<String> {
        let edges = self.edges.read();
        let mut remaining = live.iter().rev().cloned().collect::<Vec<_>>();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let free = remaining.iter().position(|candidate| {
                !remaining.iter().any(|other| {
                    other != candidate
                        && edges
                            .forward
                            .get(other)
                            .map(|targets| targets.contains(candidate))
                            .unwrap_or(false)
                })
            });
            let index = match free {
                Some(index) => index,
                None => {
                    debug!(
                        "Dependency cycle among {:?}, destroying in reverse creation order",
                        remaining
                    );
                    0
                }
            };
            order.push(remaining.remove(index));
        }
        order
    }

    /// Cycles currently present in the graph, each closed by repeating its
    /// first node
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let edges = self.edges.read();
        let mut cycles = Vec::new();
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        let mut roots = edges.forward.keys().cloned().collect::<Vec<_>>();
        roots.sort();
        for root in roots {
            if !visited.contains(&root) {
                Self::visit(
                    &edges.forward,
                    &root,
                    &mut visited,
                    &mut on_stack,
                    &mut path,
                    &mut cycles,
                );
            }
        }
        cycles
    }

    fn visit(
        forward: &HashMap<String, Vec<String>>,
        node: &str,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node.to_string());
        on_stack.insert(node.to_string());
        path.push(node.to_string());

        for next in forward.get(node).into_iter().flatten() {
            if !visited.contains(next) {
                Self::visit(forward, next, visited, on_stack, path, cycles);
            } else if on_stack.contains(next) {
                if let Some(start) = path.iter().position(|n| n == next) {
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next.clone());
                    cycles.push(cycle);
                }
            }
        }

        path.pop();
        on_stack.remove(node);
    }

    pub fn clear(&self) {
        let mut edges = self.edges.write();
        edges.forward.clear();
        edges.reverse.clear();
    }
}
