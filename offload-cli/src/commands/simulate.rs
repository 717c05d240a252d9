use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use offload_service::{
    progress_channel, InMemoryCluster, JobState, LogLevel, OffloadConfig, OffloadEvent, Offloader,
    RemoteProvider, StaticTokenGateway,
};

const SIMULATED_TOKEN: &str = "simulated";

/// Run a graph end to end against an in-memory cluster.
///
/// Results are written to the cache directory next to the graph file, the
/// same way a real run would.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Path to the graph file
    pub graph: PathBuf,

    /// Job label; {projectName} is replaced with the graph file stem
    #[arg(long, default_value = "{projectName}")]
    pub label: String,

    /// Make the simulated job fail with this error
    #[arg(long, value_name = "MESSAGE")]
    pub fail: Option<String>,

    /// Delay between status polls in milliseconds
    #[arg(long, default_value_t = 200)]
    pub interval_ms: u64,

    /// Node type needing an accelerated resource (repeatable, overrides the configuration)
    #[arg(long = "accelerated", value_name = "NODE_TYPE")]
    pub accelerated: Vec<String>,
}

pub async fn execute(args: SimulateArgs, mut config: OffloadConfig) -> Result<()> {
    config.poll_interval_ms = args.interval_ms.max(1);

    output::status("Loading", &format!("{}", args.graph.display()));
    let (_, graph) = super::load_graph(&args.graph, &config, &args.accelerated)?;

    // One executing poll per node so every node prints its line
    let mut script = vec![JobState::FullyDispatched];
    script.extend(std::iter::repeat(JobState::FullyExecuting).take(graph.len()));
    script.push(JobState::Success);

    let mut cluster = InMemoryCluster::new([SIMULATED_TOKEN])
        .with_script(script)
        .with_stdout(graph.nodes().iter().map(|n| format!("Computing {}", n.name)))
        .with_node_outputs(config.remote_cache_root.clone());
    if let Some(message) = &args.fail {
        cluster = cluster.with_failure(message.clone());
    }

    let provider: Arc<dyn RemoteProvider> = Arc::new(cluster);
    let gateway = StaticTokenGateway::new(Some(SIMULATED_TOKEN.to_string()))
        .with_provider(provider.clone());

    let (tx, mut rx) = progress_channel();
    let offloader = Offloader::new(config, Arc::new(gateway), provider).with_progress(tx);

    let accepted = offloader
        .submit(
            graph.nodes().to_vec(),
            graph.edges(),
            &args.graph,
            &args.label,
        )
        .await;

    // The watcher owns the only sender left once the offloader moves into it
    let watcher = tokio::spawn(async move { offloader.join_all().await });

    while let Some(event) = rx.recv().await {
        render(&event);
    }

    let outcomes = watcher.await?;
    if !accepted {
        color_eyre::eyre::bail!("Submission was rejected");
    }

    println!();
    if outcomes.iter().all(|o| o.succeeded()) {
        output::success("Simulation completed successfully");
        Ok(())
    } else {
        output::failure("Simulation finished with errors");
        std::process::exit(1);
    }
}

fn render(event: &OffloadEvent) {
    match event {
        OffloadEvent::JobSubmitted {
            job_id,
            job_name,
            node_count,
        } => {
            output::success(&format!(
                "Submitted '{}' as {} ({} nodes)",
                job_name, job_id, node_count
            ));
        }

        OffloadEvent::ResumingExisting { job_id, job_name } => {
            output::info(&format!("Resuming existing job '{}' ({})", job_name, job_id));
        }

        OffloadEvent::StateChanged { state, notice, .. } => {
            println!();
            output::header(state.as_str());
            if let Some(notice) = notice {
                output::dim(&format!("  {}", notice));
            }
        }

        OffloadEvent::Output { text, is_error, .. } => {
            // Providers may escape newlines in captured output
            for line in text.replace("\\n", "\n").lines() {
                if *is_error {
                    output::job_error(line);
                } else {
                    output::job_output(line);
                }
            }
        }

        OffloadEvent::Usage {
            cpu_percent,
            memory_mb,
            ..
        } => {
            output::dim(&format!(
                "  -- {:.2} % CPU | {:.2} MB memory",
                cpu_percent, memory_mb
            ));
        }

        OffloadEvent::UidMapBuilt { entries, .. } => {
            output::check(&format!("Mapped {} node cache directories", entries));
        }

        OffloadEvent::ArtifactsSynced {
            files, is_final, ..
        } => {
            if *is_final {
                output::check(&format!("Results synchronized ({} files)", files));
            } else {
                output::dim(&format!("  -- pulled {} files", files));
            }
        }

        OffloadEvent::JobFinished {
            job_id,
            state,
            error,
        } => match error {
            None => output::success(&format!("Job {} finished: {}", job_id, state)),
            Some(error) => output::failure(&format!("Job {} stopped ({}): {}", job_id, state, error)),
        },

        OffloadEvent::Log { level, message, .. } => match level {
            LogLevel::Debug => output::dim(message),
            LogLevel::Info => output::info(message),
            LogLevel::Warning => output::warning(message),
            LogLevel::Error => output::error(message),
        },
    }
}
