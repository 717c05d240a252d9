// Graph Module
// Dependency graph model, graph files and resource partitioning

pub mod document;
pub mod model;
pub mod partition;

// Re-export key types
pub use document::{GraphDocument, GraphFileError, NodeSummary};
pub use model::{DependencyGraph, Edge, GraphError, GraphErrorKind, Node, UidSet};
pub use partition::{Partition, PartitionEntry, PartitionError, PartitionErrorKind, Partitioner};
