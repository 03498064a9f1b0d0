/// Dependency-graph utilities for the scheduler
///
/// The scheduler works over id-indexed maps rather than object references:
/// a [`DependencyTracker`] holds each node's unsatisfied dependency set and
/// the reverse edges, so marking one node successful atomically yields the
/// nodes that became ready. [`topological_order`] is run once before any
/// dispatch; a cycle or an unknown dependency fails the graph up front.

use std::collections::{HashMap, HashSet, VecDeque};
use taskmill_shared::error::{TaskmillError, TaskmillResult};

/// One scheduling edge set: a node id and the ids it depends on.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub dependencies: Vec<String>,
}

/// Topologically sorts the nodes (Kahn's algorithm)
///
/// # Errors
///
/// `invalid-graph` when a dependency names an unknown node or the edges
/// contain a cycle. Runs before any sub-task is dispatched.
pub fn topological_order(nodes: &[GraphNode]) -> TaskmillResult<Vec<String>> {
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in nodes {
        in_degree.entry(node.id.as_str()).or_insert(0);
        for dep in &node.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(TaskmillError::InvalidGraph(format!(
                    "node '{}' depends on unknown node '{}'",
                    node.id, dep
                )));
            }
            *in_degree.entry(node.id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(node.id.as_str());
        }
    }

    // Seed with dependency-free nodes in declaration order.
    let mut queue: VecDeque<&str> = nodes
        .iter()
        .filter(|n| in_degree[n.id.as_str()] == 0)
        .map(|n| n.id.as_str())
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(next) = dependents.get(id) {
            for &dependent in next {
                let degree = in_degree.get_mut(dependent).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<&str> = nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !order.iter().any(|o| o == id))
            .collect();
        return Err(TaskmillError::InvalidGraph(format!(
            "dependency cycle involving: {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

/// Tracks unsatisfied dependencies while a graph executes.
#[derive(Debug)]
pub struct DependencyTracker {
    /// node id → ids of dependencies not yet terminal-success
    remaining: HashMap<String, HashSet<String>>,

    /// dependency id → nodes waiting on it
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyTracker {
    pub fn new(nodes: &[GraphNode]) -> Self {
        let mut remaining: HashMap<String, HashSet<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for node in nodes {
            remaining.insert(node.id.clone(), node.dependencies.iter().cloned().collect());
            for dep in &node.dependencies {
                dependents.entry(dep.clone()).or_default().push(node.id.clone());
            }
        }

        DependencyTracker {
            remaining,
            dependents,
        }
    }

    /// True when every dependency of `id` has been satisfied.
    pub fn is_ready(&self, id: &str) -> bool {
        self.remaining.get(id).map(|r| r.is_empty()).unwrap_or(false)
    }

    /// Marks `id` terminal-success: removes it from every remaining set
    /// and returns the nodes that just became ready.
    pub fn satisfy(&mut self, id: &str) -> Vec<String> {
        let mut newly_ready = Vec::new();
        if let Some(waiting) = self.dependents.get(id).cloned() {
            for dependent in waiting {
                if let Some(remaining) = self.remaining.get_mut(&dependent) {
                    if remaining.remove(id) && remaining.is_empty() {
                        newly_ready.push(dependent);
                    }
                }
            }
        }
        newly_ready
    }

    /// Every node whose transitive dependency closure includes `id`.
    pub fn closure_of(&self, id: &str) -> HashSet<String> {
        let mut closure = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);

        while let Some(current) = queue.pop_front() {
            if let Some(waiting) = self.dependents.get(current) {
                for dependent in waiting {
                    if closure.insert(dependent.clone()) {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        closure
    }

    /// The unsatisfied dependency ids of a node (for diagnostics).
    pub fn unsatisfied(&self, id: &str) -> Vec<String> {
        self.remaining
            .get(id)
            .map(|r| {
                let mut deps: Vec<String> = r.iter().cloned().collect();
                deps.sort();
                deps
            })
            .unwrap_or_default()
    }
}
