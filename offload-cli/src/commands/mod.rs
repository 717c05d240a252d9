// CLI Commands
// Shared graph loading for the subcommands

pub mod partition;
pub mod plan;
pub mod simulate;

use std::path::Path;

use color_eyre::Result;

use offload_service::{DependencyGraph, GraphDocument, OffloadConfig};

/// Load a graph file and build its dependency graph.
///
/// `accelerated` overrides the configured accelerated node types when not empty.
pub fn load_graph(
    path: &Path,
    config: &OffloadConfig,
    accelerated: &[String],
) -> Result<(GraphDocument, DependencyGraph)> {
    if !path.exists() {
        color_eyre::eyre::bail!("Graph file not found: {}", path.display());
    }

    let document = GraphDocument::load(path)?;
    let (nodes, edges) = document.nodes_and_edges(|node_type| {
        if accelerated.is_empty() {
            config.is_accelerated_type(node_type)
        } else {
            accelerated.iter().any(|t| t == node_type)
        }
    })?;
    let graph = DependencyGraph::new(nodes, &edges)?;
    Ok((document, graph))
}
