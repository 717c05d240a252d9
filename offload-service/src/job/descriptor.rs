// Job Descriptor Builder
// Turns a partitioned graph and its file into a submittable job

use crate::config::OffloadConfig;
use crate::graph::document::{GraphDocument, GraphFileError};
use crate::graph::model::{DependencyGraph, UidSet};
use crate::graph::partition::Partition;
use crate::remote::{JobSpec, Scheduling};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Job constant holding the container image repository
pub const DOCKER_REPO: &str = "DOCKER_REPO";
/// Job constant holding the container image tag
pub const DOCKER_TAG: &str = "DOCKER_TAG";
/// Job constant holding the command run in the container
pub const DOCKER_CMD: &str = "DOCKER_CMD";

/// Job label holding the local graph file path
pub const LABEL_FILEPATH: &str = "filepath";
/// Job label holding the sanitized temporary copy's path
pub const LABEL_TMP_FILEPATH: &str = "tmp_filepath";

/// Placeholder replaced with the graph file stem in job labels
pub const PROJECT_NAME_PLACEHOLDER: &str = "{projectName}";

/// Everything known locally about a job before it is transmitted
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub name: String,
    pub profile: String,
    pub image_repository: String,
    pub image_tag: String,
    /// Command run inside the container
    pub command: String,
    /// Local graph file the job was built from
    pub graph_file: PathBuf,
    /// Sanitized copy written for upload
    pub tmp_file: PathBuf,
    /// Remote name of the sanitized copy
    pub tmp_name: String,
    /// Remote file name to local absolute path, including the sanitized copy
    pub manifest: BTreeMap<String, PathBuf>,
    pub tags: UidSet,
    pub stop_at: Option<String>,
    pub accelerated: bool,
}

impl JobDescriptor {
    pub fn constants(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (DOCKER_REPO.to_string(), self.image_repository.clone()),
            (DOCKER_TAG.to_string(), self.image_tag.clone()),
            (DOCKER_CMD.to_string(), self.command.clone()),
        ])
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                LABEL_FILEPATH.to_string(),
                self.graph_file.to_string_lossy().into_owned(),
            ),
            (
                LABEL_TMP_FILEPATH.to_string(),
                self.tmp_file.to_string_lossy().into_owned(),
            ),
        ])
    }

    /// Provider-facing spec for this job
    pub fn to_spec(&self, config: &OffloadConfig) -> JobSpec {
        JobSpec {
            name: self.name.clone(),
            profile: self.profile.clone(),
            constants: self.constants(),
            tags: self.tags.clone(),
            labels: self.labels(),
            resources: vec![config.input_bucket.clone()],
            results: config.output_bucket.clone(),
            scheduling: Scheduling::OnDemand,
            snapshot_whitelist: Some(config.snapshot_whitelist.clone()),
        }
    }
}

/// Builds job descriptors from local graphs
pub struct DescriptorBuilder {
    config: OffloadConfig,
}

impl DescriptorBuilder {
    pub fn new(config: OffloadConfig) -> Self {
        Self { config }
    }

    /// Sanitize the graph file and describe the job computing `graph`.
    ///
    /// The rewritten copy is written to the configured temp directory under a
    /// unique name; nothing is sent anywhere. `stop_at` defaults to the
    /// graph's terminal node.
    pub fn build(
        &self,
        label: &str,
        graph: &DependencyGraph,
        partition: &Partition,
        graph_file: &Path,
        stop_at: Option<&str>,
    ) -> Result<JobDescriptor, GraphFileError> {
        let mut document = GraphDocument::load(graph_file)?;
        let mut manifest = document.rewrite_input_paths(&self.config.mount_root)?;

        let tmp_name = format!("meshroom_{}.mg", uuid::Uuid::new_v4().simple());
        let tmp_file = self.config.temp_dir.join(&tmp_name);
        document.save_to(&tmp_file)?;
        manifest.insert(tmp_name.clone(), tmp_file.clone());

        let stop_at = stop_at
            .map(str::to_string)
            .or_else(|| graph.terminal_node().map(|n| n.name.clone()));

        let mut command = format!(
            "{} {}/{}",
            self.config.compute_entrypoint,
            self.config.mount_root.trim_end_matches('/'),
            tmp_name
        );
        if let Some(node) = &stop_at {
            command.push_str(" --toNode ");
            command.push_str(node);
        }

        let accelerated = partition.requires_acceleration();
        let graph_file = std::path::absolute(graph_file).unwrap_or_else(|_| graph_file.to_path_buf());

        tracing::debug!(
            tmp_file = %tmp_file.display(),
            inputs = manifest.len(),
            accelerated,
            "job descriptor built"
        );

        Ok(JobDescriptor {
            name: job_name(label, &document),
            profile: self.config.profile_for(accelerated).to_string(),
            image_repository: self.config.image_repository.clone(),
            image_tag: self.config.image_tag.clone(),
            command,
            graph_file,
            tmp_file,
            tmp_name,
            manifest,
            tags: graph.uid_set(),
            stop_at,
            accelerated,
        })
    }
}

/// `"{label} ({file name})"`, with the project placeholder filled in
fn job_name(label: &str, document: &GraphDocument) -> String {
    let label = label.replace(PROJECT_NAME_PLACEHOLDER, &document.stem());
    let label = if label.trim().is_empty() {
        "offload"
    } else {
        label.trim()
    };
    format!("{} ({})", label, document.file_name())
}
