// Dependency Graph Model
// Nodes, edges and the validated adjacency used by the partitioner

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Set of node uids attached to a remote job as its tags
pub type UidSet = BTreeSet<String>;

/// Error type for graph construction
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Two nodes share a name
    DuplicateNode,
    /// Edge endpoint does not name a node
    UnknownNode,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn duplicate_node(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DuplicateNode,
        }
    }

    pub fn unknown_node(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownNode,
        }
    }
}

/// One pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Name, unique within a graph (e.g. `DepthMap_1`)
    pub name: String,
    /// Content-derived identifier
    pub uid: String,
    /// Declared node type (e.g. `DepthMap`)
    pub node_type: String,
    /// Whether the stage needs an accelerated (GPU) resource
    #[serde(default)]
    pub accelerated: bool,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        node_type: impl Into<String>,
        uid: impl Into<String>,
        accelerated: bool,
    ) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
            node_type: node_type.into(),
            accelerated,
        }
    }

    pub fn is_accelerated(&self) -> bool {
        self.accelerated
    }
}

/// Directed dependency: `destination` consumes the output of `source`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub destination: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// Validated node and edge sets with index-based adjacency
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    indices: HashMap<String, usize>,
    /// Children of each node, in edge order
    children: Vec<Vec<usize>>,
    /// Number of incoming edges per node
    in_degree: Vec<usize>,
}

impl DependencyGraph {
    /// Build a graph, checking node names are unique and edges reference known nodes.
    ///
    /// Duplicate edges are ignored. Acyclicity is not checked here: the
    /// partitioner reports cycles when it walks the graph.
    pub fn new(nodes: Vec<Node>, edges: &[Edge]) -> Result<Self, GraphError> {
        let mut indices = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if indices.insert(node.name.clone(), i).is_some() {
                return Err(GraphError::duplicate_node(format!(
                    "node '{}' is declared more than once",
                    node.name
                )));
            }
        }

        let mut children = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0; nodes.len()];
        let mut seen = HashSet::new();

        for edge in edges {
            let source = *indices.get(&edge.source).ok_or_else(|| {
                GraphError::unknown_node(format!(
                    "edge '{} -> {}' starts at unknown node '{}'",
                    edge.source, edge.destination, edge.source
                ))
            })?;
            let destination = *indices.get(&edge.destination).ok_or_else(|| {
                GraphError::unknown_node(format!(
                    "edge '{} -> {}' ends at unknown node '{}'",
                    edge.source, edge.destination, edge.destination
                ))
            })?;

            if seen.insert((source, destination)) {
                children[source].push(destination);
                in_degree[destination] += 1;
            }
        }

        Ok(Self {
            nodes,
            indices,
            children,
            in_degree,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index_of(name).map(|idx| &self.nodes[idx])
    }

    /// Children of a node, in the order their edges were declared
    pub fn children(&self, index: usize) -> &[usize] {
        &self.children[index]
    }

    /// Edges in declaration order, without duplicates
    pub fn edges(&self) -> Vec<Edge> {
        self.children
            .iter()
            .enumerate()
            .flat_map(|(source, children)| {
                children.iter().map(move |&destination| {
                    Edge::new(&self.nodes[source].name, &self.nodes[destination].name)
                })
            })
            .collect()
    }

    /// Nodes without incoming edges, in declaration order
    pub fn origins(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&idx| self.in_degree[idx] == 0)
            .collect()
    }

    /// Uids of every node, used as the job's tag set
    pub fn uid_set(&self) -> UidSet {
        self.nodes.iter().map(|n| n.uid.clone()).collect()
    }

    /// Last node of a topological order, the natural stop target of a run.
    ///
    /// Returns `None` when the graph is empty or contains a cycle.
    pub fn terminal_node(&self) -> Option<&Node> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: Vec<usize> = self.origins();
        ready.reverse();
        let mut last = None;
        let mut visited = 0;

        while let Some(idx) = ready.pop() {
            last = Some(idx);
            visited += 1;
            for &child in self.children[idx].iter().rev() {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.push(child);
                }
            }
        }

        if visited == self.nodes.len() {
            last.map(|idx| &self.nodes[idx])
        } else {
            None
        }
    }
}
