// In-Memory Provider
// Scripted compute cluster and bucket store for tests and dry runs

use crate::graph::document::GraphDocument;
use crate::graph::model::UidSet;
use crate::remote::{
    Bucket, ComputeClient, JobSpec, JobState, JobStatus, RemoteError, RemoteJob, RemoteProvider,
    RemoteSession, ResourceUsage, StorageClient,
};

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Files = BTreeMap<String, Vec<u8>>;

struct JobRecord {
    id: String,
    spec: JobSpec,
    state: JobState,
    script: VecDeque<JobState>,
    pending_stdout: VecDeque<String>,
    stdout: String,
    stderr: String,
    errors: Vec<String>,
    usage: ResourceUsage,
}

struct ClusterState {
    jobs: Vec<JobRecord>,
    buckets: BTreeMap<String, Files>,
    next_id: usize,
    script: Vec<JobState>,
    stdout_lines: Vec<String>,
    failure: Option<String>,
    node_outputs: Option<String>,
    status_failures: usize,
    download_failures: usize,
    fetch_failures: usize,
    revoked: bool,
}

/// A compute cluster that lives in memory.
///
/// Every status refresh advances a submitted job by one scripted state
/// (`FullyDispatched`, `FullyExecuting`, `Success` by default). On entering
/// `FullyExecuting` the graph files of the job's input buckets are copied to
/// its results bucket, mimicking the provider's snapshot.
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    tokens: Arc<BTreeSet<String>>,
}

impl InMemoryCluster {
    /// Create a cluster accepting the given tokens
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                jobs: Vec::new(),
                buckets: BTreeMap::new(),
                next_id: 1,
                script: vec![
                    JobState::FullyDispatched,
                    JobState::FullyExecuting,
                    JobState::Success,
                ],
                stdout_lines: Vec::new(),
                failure: None,
                node_outputs: None,
                status_failures: 0,
                download_failures: 0,
                fetch_failures: 0,
                revoked: false,
            })),
            tokens: Arc::new(tokens.into_iter().map(Into::into).collect()),
        }
    }

    /// States a job goes through after `Submitted`, one per refresh
    pub fn with_script(self, script: Vec<JobState>) -> Self {
        self.lock().script = script;
        self
    }

    /// Lines printed by every job while it executes, one per refresh
    pub fn with_stdout<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().stdout_lines = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Make jobs end in `Failure` with this error instead of `Success`
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        {
            let mut state = self.lock();
            state.failure = Some(message.into());
            if let Some(last) = state.script.last_mut() {
                if *last == JobState::Success {
                    *last = JobState::Failure;
                }
            }
        }
        self
    }

    /// Write a status file for every node of the snapshotted graph under
    /// `<cache_root>/<nodeType>/<uid>/` when a job starts executing
    pub fn with_node_outputs(self, cache_root: impl Into<String>) -> Self {
        self.lock().node_outputs = Some(cache_root.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` status refreshes with a transport error
    pub fn fail_status_polls(&self, count: usize) {
        self.lock().status_failures = count;
    }

    /// Fail the next `count` downloads with a transport error
    pub fn fail_downloads(&self, count: usize) {
        self.lock().download_failures = count;
    }

    /// Report the next `count` single-file fetches as missing
    pub fn fail_fetches(&self, count: usize) {
        self.lock().fetch_failures = count;
    }

    /// Reject every further call with `Unauthorized`
    pub fn revoke_tokens(&self) {
        self.lock().revoked = true;
    }

    /// Number of jobs ever submitted
    pub fn job_count(&self) -> usize {
        self.lock()
            .jobs
            .iter()
            .filter(|j| j.state != JobState::Unsubmitted)
            .count()
    }

    /// Specs of every submitted job, oldest first
    pub fn submitted_specs(&self) -> Vec<JobSpec> {
        self.lock()
            .jobs
            .iter()
            .filter(|j| j.state != JobState::Unsubmitted)
            .map(|j| j.spec.clone())
            .collect()
    }

    /// Current state of a job
    pub fn job_state(&self, id: &str) -> Option<JobState> {
        self.lock().jobs.iter().find(|j| j.id == id).map(|j| j.state)
    }

    /// Force a job into a state, bypassing its script
    pub fn set_job_state(&self, id: &str, new_state: JobState) {
        let mut state = self.lock();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            job.state = new_state;
            job.script.clear();
        }
    }

    /// Names of the files stored in a bucket
    pub fn bucket_files(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Store a file directly in a bucket, creating the bucket if needed
    pub fn put_file(&self, bucket: &str, name: &str, content: impl Into<Vec<u8>>) {
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(name.to_string(), content.into());
    }

    fn check_access(&self) -> Result<(), RemoteError> {
        if self.lock().revoked {
            return Err(RemoteError::Unauthorized("token revoked".to_string()));
        }
        Ok(())
    }

    fn handle(&self, record: &JobRecord) -> InMemoryJob {
        InMemoryJob {
            cluster: self.clone(),
            id: record.id.clone(),
            name: record.spec.name.clone(),
            tags: record.spec.tags.clone(),
            labels: record.spec.labels.clone(),
            state: record.state,
        }
    }

    /// Advance a job by one scripted step and return its status
    fn step(&self, id: &str) -> Result<JobStatus, RemoteError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.revoked {
            return Err(RemoteError::Unauthorized("token revoked".to_string()));
        }
        if state.status_failures > 0 {
            state.status_failures -= 1;
            return Err(RemoteError::Transport("status endpoint unavailable".to_string()));
        }

        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| RemoteError::NotFound(format!("job {}", id)))?;

        let previous = job.state;
        if previous != JobState::Unsubmitted && !previous.is_terminal() {
            if let Some(next) = job.script.pop_front() {
                job.state = next;
            }
        }

        if job.state == JobState::FullyExecuting || job.state.is_terminal() {
            if let Some(line) = job.pending_stdout.pop_front() {
                job.stdout.push_str(&line);
                job.stdout.push('\n');
            }
        }
        if job.state == JobState::FullyExecuting {
            job.usage.cpu_percent = (job.usage.cpu_percent + 37.5).min(100.0);
            job.usage.memory_mb += 512.0;
        }
        if job.state == JobState::Failure && previous != JobState::Failure {
            let message = state
                .failure
                .clone()
                .unwrap_or_else(|| "job failed".to_string());
            job.stderr.push_str(&message);
            job.stderr.push('\n');
            job.errors.push(message);
        }

        let status = JobStatus {
            state: job.state,
            errors: job.errors.clone(),
            usage: (job.state == JobState::FullyExecuting).then_some(job.usage),
        };

        if job.state == JobState::FullyExecuting && previous != JobState::FullyExecuting {
            let spec = job.spec.clone();
            snapshot(state, &spec);
        }

        Ok(status)
    }
}

/// Copy graph files from the input buckets to the results bucket, plus
/// generated node outputs when configured
fn snapshot(state: &mut ClusterState, spec: &JobSpec) {
    let mut copied: Files = BTreeMap::new();
    for resource in &spec.resources {
        if let Some(files) = state.buckets.get(resource) {
            for (name, content) in files {
                if name.ends_with(".mg") {
                    copied.insert(name.clone(), content.clone());
                }
            }
        }
    }

    let mut generated: Files = BTreeMap::new();
    if let Some(cache_root) = &state.node_outputs {
        for content in copied.values() {
            let Ok(value) = serde_json::from_slice::<serde_json::Value>(content) else {
                continue;
            };
            let Ok(document) = GraphDocument::from_value("snapshot.mg", value) else {
                continue;
            };
            for node in document.node_summaries().unwrap_or_default() {
                let prefix = format!("{}/{}/{}", cache_root, node.node_type, node.uid);
                generated.insert(format!("{}/status", prefix), b"SUCCESS".to_vec());
                generated.insert(
                    format!("{}/output.log", prefix),
                    format!("{} computed\n", node.name).into_bytes(),
                );
            }
        }
    }
    copied.extend(generated);

    state
        .buckets
        .entry(spec.results.clone())
        .or_default()
        .extend(copied);
}

#[async_trait]
impl RemoteProvider for InMemoryCluster {
    async fn connect(&self, token: &str) -> Result<RemoteSession, RemoteError> {
        self.check_access()?;
        if !self.tokens.contains(token) {
            return Err(RemoteError::Unauthorized("invalid token".to_string()));
        }
        Ok(RemoteSession {
            compute: Arc::new(self.clone()),
            storage: Arc::new(self.clone()),
        })
    }
}

#[async_trait]
impl ComputeClient for InMemoryCluster {
    async fn list_jobs(&self, states: &[JobState]) -> Result<Vec<Box<dyn RemoteJob>>, RemoteError> {
        self.check_access()?;
        let state = self.lock();
        Ok(state
            .jobs
            .iter()
            .filter(|j| states.contains(&j.state))
            .map(|j| Box::new(self.handle(j)) as Box<dyn RemoteJob>)
            .collect())
    }

    async fn create_job(&self, spec: JobSpec) -> Result<Box<dyn RemoteJob>, RemoteError> {
        self.check_access()?;
        let mut state = self.lock();
        let id = format!("job-{}", state.next_id);
        state.next_id += 1;

        let record = JobRecord {
            id,
            spec,
            state: JobState::Unsubmitted,
            script: state.script.iter().copied().collect(),
            pending_stdout: state.stdout_lines.iter().cloned().collect(),
            stdout: String::new(),
            stderr: String::new(),
            errors: Vec::new(),
            usage: ResourceUsage::default(),
        };
        let handle = self.handle(&record);
        state.jobs.push(record);
        Ok(Box::new(handle))
    }
}

#[async_trait]
impl StorageClient for InMemoryCluster {
    async fn get_or_create_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, RemoteError> {
        self.check_access()?;
        self.lock().buckets.entry(name.to_string()).or_default();
        Ok(Arc::new(InMemoryBucket {
            cluster: self.clone(),
            name: name.to_string(),
        }))
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), RemoteError> {
        self.check_access()?;
        self.lock().buckets.remove(name);
        Ok(())
    }
}

/// Handle to a job of an [`InMemoryCluster`]
pub struct InMemoryJob {
    cluster: InMemoryCluster,
    id: String,
    name: String,
    tags: UidSet,
    labels: BTreeMap<String, String>,
    state: JobState,
}

#[async_trait]
impl RemoteJob for InMemoryJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &UidSet {
        &self.tags
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    fn state(&self) -> JobState {
        self.state
    }

    async fn submit(&mut self) -> Result<(), RemoteError> {
        self.cluster.check_access()?;
        let mut state = self.cluster.lock();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == self.id)
            .ok_or_else(|| RemoteError::NotFound(format!("job {}", self.id)))?;

        if job.state != JobState::Unsubmitted {
            return Err(RemoteError::Rejected(format!("job {} already submitted", self.id)));
        }
        job.state = JobState::Submitted;
        self.state = JobState::Submitted;
        Ok(())
    }

    async fn refresh_status(&mut self) -> Result<JobStatus, RemoteError> {
        let status = self.cluster.step(&self.id)?;
        self.state = status.state;
        Ok(status)
    }

    async fn fresh_stdout(&mut self) -> Result<String, RemoteError> {
        self.cluster.check_access()?;
        let mut state = self.cluster.lock();
        Ok(state
            .jobs
            .iter_mut()
            .find(|j| j.id == self.id)
            .map(|j| std::mem::take(&mut j.stdout))
            .unwrap_or_default())
    }

    async fn fresh_stderr(&mut self) -> Result<String, RemoteError> {
        self.cluster.check_access()?;
        let mut state = self.cluster.lock();
        Ok(state
            .jobs
            .iter_mut()
            .find(|j| j.id == self.id)
            .map(|j| std::mem::take(&mut j.stderr))
            .unwrap_or_default())
    }

    async fn wait(&mut self, timeout: Duration) -> Result<bool, RemoteError> {
        tokio::time::sleep(timeout).await;
        let state = self.cluster.job_state(&self.id).unwrap_or(self.state);
        Ok(state.is_terminal())
    }
}

/// Handle to a bucket of an [`InMemoryCluster`]
pub struct InMemoryBucket {
    cluster: InMemoryCluster,
    name: String,
}

#[async_trait]
impl Bucket for InMemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sync_upload(&self, files: &BTreeMap<String, PathBuf>) -> Result<usize, RemoteError> {
        self.cluster.check_access()?;
        let mut uploaded = Files::new();
        for (remote_name, local_path) in files {
            let content = tokio::fs::read(local_path).await.map_err(|e| {
                RemoteError::LocalIo(format!("{}: {}", local_path.display(), e))
            })?;
            uploaded.insert(remote_name.clone(), content);
        }

        let count = uploaded.len();
        self.cluster
            .lock()
            .buckets
            .entry(self.name.clone())
            .or_default()
            .extend(uploaded);
        Ok(count)
    }

    async fn sync_download(&self, remote_dir: &str, local_dir: &Path) -> Result<usize, RemoteError> {
        self.cluster.check_access()?;
        let prefix = format!("{}/", remote_dir.trim_end_matches('/'));
        let files: Vec<(String, Vec<u8>)> = {
            let mut state = self.cluster.lock();
            if state.download_failures > 0 {
                state.download_failures -= 1;
                return Err(RemoteError::Transport("download interrupted".to_string()));
            }
            state
                .buckets
                .get(&self.name)
                .map(|files| {
                    files
                        .iter()
                        .filter_map(|(name, content)| {
                            name.strip_prefix(&prefix)
                                .map(|rel| (rel.to_string(), content.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        for (relative, content) in &files {
            let target = local_dir.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
        }
        Ok(files.len())
    }

    async fn fetch_file(&self, remote_name: &str, local_path: &Path) -> Result<(), RemoteError> {
        self.cluster.check_access()?;
        let content = {
            let mut state = self.cluster.lock();
            if state.fetch_failures > 0 {
                state.fetch_failures -= 1;
                None
            } else {
                state
                    .buckets
                    .get(&self.name)
                    .and_then(|files| files.get(remote_name).cloned())
            }
        }
        .ok_or_else(|| RemoteError::NotFound(format!("{} in bucket {}", remote_name, self.name)))?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, content).await?;
        Ok(())
    }
}
