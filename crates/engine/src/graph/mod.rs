//! Dependency graph — orders start/stop/remove across a pod's containers.
//!
//! Nodes are container IDs; an edge A → B means A must be running before B
//! starts. Cycles are rejected at build time, before any container is
//! touched. Traversal helpers return orders; the lifecycle engine owns the
//! per-container error bookkeeping.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::{short_id, EngineError};

#[derive(Debug)]
pub struct DepGraph {
    /// id → dependencies present in the node set.
    deps: HashMap<String, Vec<String>>,
    /// id → nodes that depend on it.
    dependents: HashMap<String, Vec<String>>,
    /// Roots: nodes with no dependencies inside the set.
    no_dep_nodes: Vec<String>,
}

impl DepGraph {
    /// Build the graph from `(id, dependencies)` pairs. Dependencies outside
    /// the node set (e.g. cross-pod references already validated at add
    /// time) are ignored for ordering purposes.
    pub fn build<I>(nodes: I) -> Result<DepGraph, EngineError>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        for (id, node_deps) in nodes {
            deps.insert(id, node_deps);
        }
        let ids: HashSet<String> = deps.keys().cloned().collect();

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut no_dep_nodes = Vec::new();
        for (id, node_deps) in &mut deps {
            node_deps.retain(|d| ids.contains(d));
            if node_deps.is_empty() {
                no_dep_nodes.push(id.clone());
            }
            for dep in node_deps {
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
        }
        no_dep_nodes.sort();

        let graph = DepGraph {
            deps,
            dependents,
            no_dep_nodes,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<(), EngineError> {
        // Kahn's algorithm; any node left with in-degree > 0 is on a cycle.
        let mut in_degree: HashMap<&str, usize> = self
            .deps
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(dependents) = self.dependents.get(id) {
                for dependent in dependents {
                    if let Some(d) = in_degree.get_mut(dependent.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }
        if visited != self.deps.len() {
            let mut cyclic: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| short_id(id))
                .collect();
            cyclic.sort();
            return Err(EngineError::PodCyclicDependency(cyclic.join(", ")));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn no_dep_nodes(&self) -> &[String] {
        &self.no_dep_nodes
    }

    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.deps.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Dependencies-first order: every node appears after all of its
    /// prerequisites. Deterministic (ties broken by ID).
    pub fn start_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .deps
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();
        let mut ready: Vec<&str> = self.no_dep_nodes.iter().map(String::as_str).collect();
        let mut order = Vec::with_capacity(self.deps.len());
        while let Some(id) = ready.pop() {
            order.push(id.to_string());
            if let Some(dependents) = self.dependents.get(id) {
                for dependent in dependents {
                    if let Some(d) = in_degree.get_mut(dependent.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(dependent.as_str());
                        }
                    }
                }
            }
            // Keep pop() yielding the smallest remaining ID.
            ready.sort();
            ready.reverse();
        }
        order
    }

    /// Reverse topological order: roots visited last. Used for stop and
    /// remove.
    pub fn stop_order(&self) -> Vec<String> {
        let mut order = self.start_order();
        order.reverse();
        order
    }

    /// The transitive closure of nodes blocked by a failure at `id`,
    /// excluding `id` itself. These must not be visited once `id` fails.
    pub fn blocked_by(&self, id: &str) -> HashSet<String> {
        let mut blocked = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if blocked.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, deps: &[&str]) -> (String, Vec<String>) {
        (
            id.to_string(),
            deps.iter().map(|d| d.to_string()).collect(),
        )
    }

    #[test]
    fn test_chain_order() {
        let graph =
            DepGraph::build([node("a", &[]), node("b", &["a"]), node("c", &["b"])]).unwrap();
        assert_eq!(graph.no_dep_nodes(), &["a".to_string()]);
        assert_eq!(graph.start_order(), vec!["a", "b", "c"]);
        assert_eq!(graph.stop_order(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_diamond_visits_each_once() {
        let graph = DepGraph::build([
            node("root", &[]),
            node("left", &["root"]),
            node("right", &["root"]),
            node("sink", &["left", "right"]),
        ])
        .unwrap();
        let order = graph.start_order();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "root");
        assert_eq!(order[3], "sink");
        let unique: HashSet<&String> = order.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_cycle_rejected_at_build() {
        let err = DepGraph::build([node("a", &["b"]), node("b", &["a"])]).unwrap_err();
        assert!(matches!(err, EngineError::PodCyclicDependency(_)));
    }

    #[test]
    fn test_self_cycle_rejected() {
        let err = DepGraph::build([node("a", &["a"])]).unwrap_err();
        assert!(matches!(err, EngineError::PodCyclicDependency(_)));
    }

    #[test]
    fn test_blocked_by_failure() {
        let graph = DepGraph::build([
            node("infra", &[]),
            node("db", &["infra"]),
            node("web", &["db"]),
            node("other", &["infra"]),
        ])
        .unwrap();
        let blocked = graph.blocked_by("db");
        assert!(blocked.contains("web"));
        assert!(!blocked.contains("other"));
        assert!(!blocked.contains("infra"));
    }

    #[test]
    fn test_external_deps_ignored() {
        let graph = DepGraph::build([node("a", &["outside-the-pod"])]).unwrap();
        assert_eq!(graph.no_dep_nodes(), &["a".to_string()]);
    }
}
