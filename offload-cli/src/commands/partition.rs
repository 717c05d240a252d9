use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use offload_service::{OffloadConfig, Partitioner};

/// Show the resource partition of a graph file
#[derive(Args, Debug)]
pub struct PartitionArgs {
    /// Path to the graph file
    pub graph: PathBuf,

    /// Node type needing an accelerated resource (repeatable, overrides the configuration)
    #[arg(long = "accelerated", value_name = "NODE_TYPE")]
    pub accelerated: Vec<String>,
}

pub fn execute(args: PartitionArgs, config: OffloadConfig) -> Result<()> {
    output::status("Partitioning", &format!("{}", args.graph.display()));
    let (_, graph) = super::load_graph(&args.graph, &config, &args.accelerated)?;

    let accelerated = graph.nodes().iter().filter(|n| n.accelerated).count();
    output::info(&format!(
        "{} nodes ({} accelerated)",
        graph.len(),
        accelerated
    ));

    let partition = Partitioner::by_flag().partition(&graph)?;

    println!();
    output::header(&format!(
        "{} run(s), max depth {}",
        partition.len(),
        partition.max_depth()
    ));
    for (name, entry) in partition.iter() {
        let resource = if entry.accelerated { "accelerated" } else { "standard" };
        output::row(
            name,
            &format!("{} depth {} (from {})", resource, entry.depth, entry.head),
        );
    }

    println!();
    output::success(&format!(
        "Profile: {}",
        config.profile_for(partition.requires_acceleration())
    ));
    Ok(())
}
