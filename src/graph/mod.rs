//! Dependency graph over work items.
//!
//! Nodes are keyed by item id and keep both edge directions so ready-set
//! and impact queries stay O(edges touched). Edges are symmetric by
//! construction: adding `a -> depends on -> b` also records `a` as a
//! dependent of `b`, auto-creating `b` if it was never declared.

use crate::{TrackerError, TrackerResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// A single graph node with both edge directions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub dependencies: HashSet<String>,
    pub dependents: HashSet<String>,
}

/// Flat processing order plus level grouping. Nodes within one level have
/// no edges between them and can be processed in parallel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionOrder {
    pub order: Vec<String>,
    pub levels: Vec<Vec<String>>,
}

/// Dependency graph with cycle detection, topological ordering, and
/// ready-frontier queries. Owned and mutated by a single coordinating
/// workflow instance; the scheduler side only reads.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    // BTreeMap keeps iteration order deterministic for orders and levels
    nodes: BTreeMap<String, Node>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a node with its dependencies. Back-fills the dependent edge
    /// on each dependency, creating missing dependency nodes on first
    /// reference.
    pub fn add_node(&mut self, id: impl Into<String>, dependencies: Vec<String>) {
        let id = id.into();

        let node = self.nodes.entry(id.clone()).or_insert_with(|| Node {
            id: id.clone(),
            ..Node::default()
        });
        for dep in &dependencies {
            node.dependencies.insert(dep.clone());
        }

        for dep in dependencies {
            let dep_node = self.nodes.entry(dep.clone()).or_insert_with(|| Node {
                id: dep.clone(),
                ..Node::default()
            });
            dep_node.dependents.insert(id.clone());
        }
    }

    /// Remove a node, pruning its edges out of every neighbor's edge sets
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        for dep in &node.dependencies {
            if let Some(n) = self.nodes.get_mut(dep) {
                n.dependents.remove(id);
            }
        }
        for dependent in &node.dependents {
            if let Some(n) = self.nodes.get_mut(dependent) {
                n.dependencies.remove(id);
            }
        }
        Some(node)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Find all cycles. Each cycle is reported as the path from the
    /// back-edge target around to itself, e.g. `["a", "b", "a"]`.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: HashSet<&str> = HashSet::new();

        for start in self.nodes.keys() {
            if !visited.contains(start.as_str()) {
                self.dfs_cycles(start, &mut visited, &mut stack, &mut on_stack, &mut cycles);
            }
        }
        cycles
    }

    fn dfs_cycles<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(id);
        stack.push(id);
        on_stack.insert(id);

        if let Some(node) = self.nodes.get(id) {
            // BTreeSet-like ordering keeps cycle reports stable across runs
            let mut deps: Vec<&String> = node.dependencies.iter().collect();
            deps.sort();
            for dep in deps {
                if !visited.contains(dep.as_str()) {
                    self.dfs_cycles(dep, visited, stack, on_stack, cycles);
                } else if on_stack.contains(dep.as_str()) {
                    // Back edge into the recursion stack: slice out the loop
                    let from = stack.iter().position(|&n| n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[from..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    cycles.push(cycle);
                }
            }
        }

        stack.pop();
        on_stack.remove(id);
    }

    /// Kahn's algorithm. Fails with `CycleDetected` when any cycle exists;
    /// otherwise returns the flat order plus levels of simultaneously-ready
    /// nodes (safe to process in parallel within a level).
    pub fn resolution_order(&self) -> TrackerResult<ResolutionOrder> {
        let cycles = self.detect_cycles();
        if let Some(cycle) = cycles.into_iter().next() {
            return Err(TrackerError::CycleDetected(cycle));
        }

        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.as_str(), node.dependencies.len()))
            .collect();

        let mut frontier: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        frontier.sort_unstable();

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut levels = Vec::new();

        while !frontier.is_empty() {
            let level: Vec<String> = frontier.iter().map(|s| s.to_string()).collect();
            order.extend(level.iter().cloned());

            let mut next: Vec<&str> = Vec::new();
            for id in frontier.drain(..) {
                if let Some(node) = self.nodes.get(id) {
                    for dependent in &node.dependents {
                        if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                            *deg -= 1;
                            if *deg == 0 {
                                next.push(dependent.as_str());
                            }
                        }
                    }
                }
            }
            next.sort_unstable();
            levels.push(level);
            frontier = next;
        }

        debug_assert_eq!(order.len(), self.nodes.len());
        Ok(ResolutionOrder { order, levels })
    }

    /// Nodes not yet completed whose dependencies are all completed —
    /// the ready frontier for incremental scheduling.
    pub fn ready_nodes(&self, completed: &HashSet<String>) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| {
                !completed.contains(&node.id)
                    && node.dependencies.iter().all(|dep| completed.contains(dep))
            })
            .map(|node| node.id.clone())
            .collect()
    }

    /// Everything `id` transitively depends on
    pub fn transitive_dependencies(&self, id: &str) -> HashSet<String> {
        self.walk(id, |node| &node.dependencies)
    }

    /// Everything transitively depending on `id` (the blast radius of a
    /// failure)
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        self.walk(id, |node| &node.dependents)
    }

    fn walk<'a, F>(&'a self, id: &str, edges: F) -> HashSet<String>
    where
        F: Fn(&'a Node) -> &'a HashSet<String>,
    {
        let mut result = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(id);

        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(current) {
                for next in edges(node) {
                    if visited.insert(next.as_str()) {
                        result.insert(next.clone());
                        queue.push_back(next.as_str());
                    }
                }
            }
        }
        result
    }
}
