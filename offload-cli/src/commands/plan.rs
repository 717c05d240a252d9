use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use offload_service::{DescriptorBuilder, OffloadConfig, Partitioner};

/// Build the job a graph would be submitted as, without contacting any provider
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the graph file
    pub graph: PathBuf,

    /// Job label; {projectName} is replaced with the graph file stem
    #[arg(long, default_value = "{projectName}")]
    pub label: String,

    /// Stop computing at this node (default: the graph's last node)
    #[arg(long, value_name = "NODE")]
    pub stop_at: Option<String>,

    /// Node type needing an accelerated resource (repeatable, overrides the configuration)
    #[arg(long = "accelerated", value_name = "NODE_TYPE")]
    pub accelerated: Vec<String>,

    /// Keep the sanitized graph copy instead of deleting it
    #[arg(long)]
    pub keep: bool,
}

pub fn execute(args: PlanArgs, config: OffloadConfig) -> Result<()> {
    output::status("Planning", &format!("{}", args.graph.display()));
    let (_, graph) = super::load_graph(&args.graph, &config, &args.accelerated)?;

    if let Some(node) = &args.stop_at {
        if graph.get(node).is_none() {
            color_eyre::eyre::bail!("Unknown node '{}'", node);
        }
    }

    let partition = Partitioner::by_flag().partition(&graph)?;
    let descriptor = DescriptorBuilder::new(config.clone()).build(
        &args.label,
        &graph,
        &partition,
        &args.graph,
        args.stop_at.as_deref(),
    )?;
    let spec = descriptor.to_spec(&config);

    println!();
    output::header(&format!("Job '{}'", spec.name));
    output::row("image", &config.image());
    output::row("profile", &spec.profile);
    output::row("scheduling", &format!("{:?}", spec.scheduling));
    for (key, value) in &spec.constants {
        output::row(key, value);
    }
    output::row("input bucket", &spec.resources.join(", "));
    output::row("output bucket", &spec.results);
    output::row("tags", &format!("{} node uid(s)", spec.tags.len()));
    for (key, value) in &spec.labels {
        output::row(&format!("label {}", key), value);
    }

    println!();
    output::header(&format!("Uploads ({})", descriptor.manifest.len()));
    for (remote, local) in &descriptor.manifest {
        output::row(remote, &local.display().to_string());
    }

    println!();
    if args.keep {
        output::info(&format!(
            "Sanitized graph kept at {}",
            descriptor.tmp_file.display()
        ));
    } else {
        std::fs::remove_file(&descriptor.tmp_file)?;
        output::dim("Sanitized graph removed (use --keep to inspect it)");
    }
    output::success("Plan complete, nothing was submitted");
    Ok(())
}
