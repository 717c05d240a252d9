// Graph Partitioner
// Groups contiguous stages with the same resource requirement into runs

use crate::graph::model::{DependencyGraph, Node};

use std::collections::BTreeMap;
use std::fmt;

/// Error type for partitioning
#[derive(Debug, Clone)]
pub struct PartitionError {
    pub message: String,
    pub kind: PartitionErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionErrorKind {
    /// No nodes were submitted
    EmptyGraph,
    /// Every node has an incoming edge
    NoOrigin,
    /// Traversal came back to a node on the current path
    CyclicDependency,
    /// Some nodes cannot be reached from any origin
    Unreachable,
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition error: {}", self.message)
    }
}

impl std::error::Error for PartitionError {}

impl PartitionError {
    pub fn empty_graph() -> Self {
        Self {
            message: "the submitted graph has no nodes".to_string(),
            kind: PartitionErrorKind::EmptyGraph,
        }
    }

    pub fn no_origin() -> Self {
        Self {
            message: "every node has an incoming edge, the graph is not a DAG".to_string(),
            kind: PartitionErrorKind::NoOrigin,
        }
    }

    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: PartitionErrorKind::CyclicDependency,
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: PartitionErrorKind::Unreachable,
        }
    }
}

/// One collapsed run of same-requirement stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Whether the run needs an accelerated resource
    pub accelerated: bool,
    /// Number of requirement changes between the origin and this run
    pub depth: usize,
    /// First node of the run
    pub head: String,
}

/// Mapping from the most-downstream node of each run to its entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    entries: BTreeMap<String, PartitionEntry>,
}

impl Partition {
    pub fn get(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PartitionEntry)> {
        self.entries.iter()
    }

    /// Names keying the entries, in sorted order
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Whether any run needs an accelerated resource
    pub fn requires_acceleration(&self) -> bool {
        self.entries.values().any(|e| e.accelerated)
    }

    /// Deepest run
    pub fn max_depth(&self) -> usize {
        self.entries.values().map(|e| e.depth).max().unwrap_or(0)
    }

    /// First node of every run, with the run's requirement and depth
    pub fn run_heads(&self) -> BTreeMap<String, (bool, usize)> {
        self.entries
            .values()
            .map(|e| (e.head.clone(), (e.accelerated, e.depth)))
            .collect()
    }

    /// One-line summary, e.g. `Export:cpu@2, Meshing:gpu@1`
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|(name, e)| {
                format!(
                    "{}:{}@{}",
                    name,
                    if e.accelerated { "gpu" } else { "cpu" },
                    e.depth
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Walks a dependency graph and collapses same-requirement runs
pub struct Partitioner<F> {
    requires_acceleration: F,
}

impl Partitioner<fn(&Node) -> bool> {
    /// Partition by each node's own `accelerated` flag
    pub fn by_flag() -> Self {
        Self {
            requires_acceleration: Node::is_accelerated,
        }
    }
}

impl<F> Partitioner<F>
where
    F: Fn(&Node) -> bool,
{
    /// Partition with a custom resource-requirement predicate
    pub fn new(requires_acceleration: F) -> Self {
        Self {
            requires_acceleration,
        }
    }

    /// Walk the graph depth-first from every origin and build the partition.
    ///
    /// A node whose requirement matches its predecessor takes over the
    /// predecessor's entry; a differing node opens a new entry one level
    /// deeper. Reaching an already visited node with the same requirement
    /// as the current one drops the current entry, merging the branches.
    pub fn partition(&self, graph: &DependencyGraph) -> Result<Partition, PartitionError> {
        if graph.is_empty() {
            return Err(PartitionError::empty_graph());
        }

        let origins = graph.origins();
        if origins.is_empty() {
            return Err(PartitionError::no_origin());
        }

        let flags: Vec<bool> = graph
            .nodes()
            .iter()
            .map(|n| (self.requires_acceleration)(n))
            .collect();

        let mut walk = Walk {
            graph,
            flags: &flags,
            entries: BTreeMap::new(),
            treated: vec![false; graph.len()],
            on_path: vec![false; graph.len()],
            run_depth: vec![0; graph.len()],
            run_head: (0..graph.len()).collect(),
        };

        for origin in origins {
            walk.traverse(origin)?;
        }

        let unreached: Vec<&str> = (0..graph.len())
            .filter(|&idx| !walk.treated[idx])
            .map(|idx| graph.node(idx).name.as_str())
            .collect();
        if !unreached.is_empty() {
            return Err(PartitionError::unreachable(format!(
                "nodes not reachable from any origin (cycle?): {}",
                unreached.join(", ")
            )));
        }

        Ok(Partition {
            entries: walk.entries,
        })
    }
}

struct Frame {
    node: usize,
    next_child: usize,
}

struct Walk<'a> {
    graph: &'a DependencyGraph,
    flags: &'a [bool],
    entries: BTreeMap<String, PartitionEntry>,
    treated: Vec<bool>,
    on_path: Vec<bool>,
    run_depth: Vec<usize>,
    run_head: Vec<usize>,
}

impl Walk<'_> {
    fn name(&self, idx: usize) -> &str {
        &self.graph.node(idx).name
    }

    /// Depth-first walk from one origin with an explicit stack
    fn traverse(&mut self, origin: usize) -> Result<(), PartitionError> {
        self.enter(origin, None);
        let mut stack = vec![Frame {
            node: origin,
            next_child: 0,
        }];

        let graph = self.graph;
        while let Some(frame) = stack.last_mut() {
            let current = frame.node;
            let children = graph.children(current);

            if frame.next_child == children.len() {
                self.on_path[current] = false;
                stack.pop();
                continue;
            }

            let child = children[frame.next_child];
            frame.next_child += 1;

            if self.on_path[child] {
                let mut path: Vec<&str> = stack.iter().map(|f| self.name(f.node)).collect();
                path.push(self.name(child));
                return Err(PartitionError::cyclic(format!(
                    "circular dependency detected: {}",
                    path.join(" -> ")
                )));
            }

            if !self.treated[child] {
                self.enter(child, Some(current));
                stack.push(Frame {
                    node: child,
                    next_child: 0,
                });
            } else if self.flags[child] == self.flags[current] {
                let name = self.name(current).to_string();
                self.entries.remove(&name);
            } else {
                tracing::debug!(
                    node = self.name(current),
                    merge = self.name(child),
                    "converging branches disagree on resource requirement, keeping upstream entry"
                );
            }
        }

        Ok(())
    }

    fn enter(&mut self, node: usize, previous: Option<usize>) {
        self.treated[node] = true;
        self.on_path[node] = true;

        let entry = match previous {
            None => {
                self.run_depth[node] = 0;
                self.run_head[node] = node;
                PartitionEntry {
                    accelerated: self.flags[node],
                    depth: 0,
                    head: self.name(node).to_string(),
                }
            }
            Some(prev) if self.flags[prev] == self.flags[node] => {
                self.run_depth[node] = self.run_depth[prev];
                self.run_head[node] = self.run_head[prev];
                let prev_name = self.name(prev).to_string();
                // The predecessor's entry is gone when a sibling already took it over
                self.entries
                    .remove(&prev_name)
                    .unwrap_or_else(|| PartitionEntry {
                        accelerated: self.flags[prev],
                        depth: self.run_depth[prev],
                        head: self.name(self.run_head[prev]).to_string(),
                    })
            }
            Some(prev) => {
                self.run_depth[node] = self.run_depth[prev] + 1;
                self.run_head[node] = node;
                PartitionEntry {
                    accelerated: self.flags[node],
                    depth: self.run_depth[node],
                    head: self.name(node).to_string(),
                }
            }
        };

        let name = self.name(node).to_string();
        self.entries.insert(name, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::Edge;

    fn graph(nodes: &[(&str, bool)], edges: &[(&str, &str)]) -> DependencyGraph {
        DependencyGraph::new(
            nodes
                .iter()
                .map(|(name, acc)| Node::new(*name, "Stage", format!("uid-{}", name), *acc))
                .collect(),
            &edges
                .iter()
                .map(|(s, d)| Edge::new(*s, *d))
                .collect::<Vec<_>>(),
        )
        .unwrap()
    }

    fn partition(g: &DependencyGraph) -> Partition {
        Partitioner::by_flag().partition(g).unwrap()
    }

    #[test]
    fn test_single_node() {
        let p = partition(&graph(&[("Only", true)], &[]));
        assert_eq!(p.len(), 1);
        assert_eq!(p.get("Only").unwrap().depth, 0);
        assert!(p.get("Only").unwrap().accelerated);
    }

    #[test]
    fn test_uniform_chain_collapses_to_last_node() {
        let g = graph(
            &[("A", false), ("B", false), ("C", false)],
            &[("A", "B"), ("B", "C")],
        );
        let p = partition(&g);
        assert_eq!(p.keys(), vec!["C"]);
        assert_eq!(p.get("C").unwrap().depth, 0);
        assert_eq!(p.get("C").unwrap().head, "A");
    }

    #[test]
    fn test_uniform_diamond_collapses_to_sink() {
        let g = graph(
            &[("A", true), ("B", true), ("C", true), ("D", true)],
            &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
        );
        let p = partition(&g);
        assert_eq!(p.keys(), vec!["D"]);
        assert_eq!(p.get("D").unwrap().depth, 0);
    }

    #[test]
    fn test_mixed_chain_depths() {
        let g = graph(
            &[("A", false), ("B", true), ("C", true), ("D", false)],
            &[("A", "B"), ("B", "C"), ("C", "D")],
        );
        let p = partition(&g);

        // Runs are keyed by their most-downstream node
        assert_eq!(p.keys(), vec!["A", "C", "D"]);
        assert_eq!(p.get("C").unwrap().depth, 1);
        assert!(p.get("C").unwrap().accelerated);
        assert_eq!(p.get("D").unwrap().depth, 2);
        assert!(!p.get("D").unwrap().accelerated);
        assert!(!p.contains("B"));

        // Run starts: the accelerated run begins at B, the last run at D
        let heads = p.run_heads();
        assert_eq!(heads.get("B"), Some(&(true, 1)));
        assert_eq!(heads.get("D"), Some(&(false, 2)));
        assert_eq!(heads.get("A"), Some(&(false, 0)));
        assert!(!heads.contains_key("C"));
    }

    #[test]
    fn test_partition_is_idempotent() {
        let g = graph(
            &[("A", false), ("B", true), ("C", false), ("D", true), ("E", false)],
            &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D"), ("D", "E")],
        );
        let partitioner = Partitioner::by_flag();
        let first = partitioner.partition(&g).unwrap();
        let second = partitioner.partition(&g).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.summary(), second.summary());
    }

    #[test]
    fn test_converging_equal_branches_merge() {
        // A(cpu) -> B(gpu) -> D(cpu) and A -> C(cpu) -> D
        let g = graph(
            &[("A", false), ("B", true), ("C", false), ("D", false)],
            &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
        );
        let p = partition(&g);
        assert_eq!(p.keys(), vec!["B", "D"]);
        assert_eq!(p.get("B").unwrap().depth, 1);
        assert_eq!(p.get("D").unwrap().depth, 2);
    }

    #[test]
    fn test_converging_conflicting_branches_keep_upstream_entry() {
        // A(cpu) -> B(cpu) -> D(cpu) and A -> C(gpu) -> D
        let g = graph(
            &[("A", false), ("B", false), ("C", true), ("D", false)],
            &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
        );
        let p = partition(&g);
        assert_eq!(p.keys(), vec!["C", "D"]);
        assert_eq!(p.get("C").unwrap().depth, 1);
        assert!(p.get("C").unwrap().accelerated);
        assert_eq!(p.get("D").unwrap().depth, 0);
    }

    #[test]
    fn test_independent_origins_merging() {
        // Two origins feeding the same sink
        let g = graph(
            &[("X", false), ("Y", false), ("Z", false)],
            &[("X", "Z"), ("Y", "Z")],
        );
        let p = partition(&g);
        assert_eq!(p.keys(), vec!["Z"]);
    }

    #[test]
    fn test_requires_acceleration() {
        let cpu_only = partition(&graph(&[("A", false), ("B", false)], &[("A", "B")]));
        assert!(!cpu_only.requires_acceleration());

        let mixed = partition(&graph(&[("A", false), ("B", true)], &[("A", "B")]));
        assert!(mixed.requires_acceleration());
        assert_eq!(mixed.max_depth(), 1);
    }

    #[test]
    fn test_custom_predicate() {
        let g = graph(&[("A", false), ("DepthB", false)], &[("A", "DepthB")]);
        let p = Partitioner::new(|n: &Node| n.name.starts_with("Depth"))
            .partition(&g)
            .unwrap();
        assert!(p.get("DepthB").unwrap().accelerated);
        assert_eq!(p.get("DepthB").unwrap().depth, 1);
    }

    #[test]
    fn test_cycle_detection() {
        let g = graph(
            &[("A", false), ("B", false), ("C", false)],
            &[("A", "B"), ("B", "C"), ("C", "B")],
        );
        let err = Partitioner::by_flag().partition(&g).unwrap_err();
        assert_eq!(err.kind, PartitionErrorKind::CyclicDependency);
        assert!(err.message.contains("B -> C -> B"));
    }

    #[test]
    fn test_no_origin() {
        let g = graph(&[("A", false), ("B", false)], &[("A", "B"), ("B", "A")]);
        let err = Partitioner::by_flag().partition(&g).unwrap_err();
        assert_eq!(err.kind, PartitionErrorKind::NoOrigin);
    }

    #[test]
    fn test_unreachable_cycle() {
        let g = graph(
            &[("X", false), ("Y", false), ("Z", false)],
            &[("Y", "Z"), ("Z", "Y")],
        );
        let err = Partitioner::by_flag().partition(&g).unwrap_err();
        assert_eq!(err.kind, PartitionErrorKind::Unreachable);
        assert!(err.message.contains("Y"));
    }

    #[test]
    fn test_empty_graph() {
        let g = graph(&[], &[]);
        let err = Partitioner::by_flag().partition(&g).unwrap_err();
        assert_eq!(err.kind, PartitionErrorKind::EmptyGraph);
    }
}
