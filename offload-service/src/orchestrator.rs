// Offload Orchestrator
// Single entry point: validate, partition, describe, then submit and watch in the background

use crate::config::OffloadConfig;
use crate::credential::CredentialGateway;
use crate::error::{ServiceError, ServiceResult};
use crate::events::{EventSender, OffloadEvent, ProgressSender};
use crate::graph::model::{DependencyGraph, Edge, Node, UidSet};
use crate::graph::partition::Partitioner;
use crate::job::descriptor::{DescriptorBuilder, JobDescriptor};
use crate::job::lifecycle::{LifecycleManager, WatchOutcome};
use crate::remote::{JobState, RemoteError, RemoteProvider};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Id and name of the job a watcher follows, once known
type JobSlot = Arc<Mutex<Option<(String, String)>>>;

struct Watcher {
    job: JobSlot,
    handle: JoinHandle<WatchOutcome>,
}

/// Submits graphs for remote execution and keeps one watcher per node set
pub struct Offloader {
    config: OffloadConfig,
    gateway: Arc<dyn CredentialGateway>,
    provider: Arc<dyn RemoteProvider>,
    event_tx: Option<ProgressSender>,
    watchers: Arc<Mutex<HashMap<UidSet, Watcher>>>,
}

impl Offloader {
    pub fn new(
        config: OffloadConfig,
        gateway: Arc<dyn CredentialGateway>,
        provider: Arc<dyn RemoteProvider>,
    ) -> Self {
        Self {
            config,
            gateway,
            provider,
            event_tx: None,
            watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<UidSet, Watcher>> {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offload a graph.
    ///
    /// Returns `false` when no valid token is available or the graph cannot
    /// be prepared locally. Otherwise the job is submitted (or a running job
    /// for the same nodes is reattached) and watched on a background task;
    /// everything that happens remotely is reported through events only.
    pub async fn submit(
        &self,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        graph_file: impl AsRef<Path>,
        label: &str,
    ) -> bool {
        let graph_file = graph_file.as_ref();
        self.prune_finished();

        let token = match self.check_token().await {
            Ok(token) => token,
            Err(e) => {
                self.reject(e);
                return false;
            }
        };

        let graph = match DependencyGraph::new(nodes, &edges) {
            Ok(graph) => graph,
            Err(e) => {
                self.reject(e.into());
                return false;
            }
        };
        let uids = graph.uid_set();

        if self.resume_watched(&uids) {
            return true;
        }

        let descriptor = match self.prepare(&graph, graph_file, label) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.reject(e);
                return false;
            }
        };

        let mut registry = self.registry();
        if registry.get(&uids).map(|w| !w.handle.is_finished()).unwrap_or(false) {
            // Another submission for the same nodes won the race
            drop(registry);
            discard(&descriptor.tmp_file);
            return self.resume_watched(&uids);
        }

        let job: JobSlot = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(run_job(
            JobContext {
                config: self.config.clone(),
                gateway: self.gateway.clone(),
                provider: self.provider.clone(),
                event_tx: self.event_tx.clone(),
                job: job.clone(),
                token,
                uids: uids.clone(),
                nodes: graph.nodes().to_vec(),
            },
            descriptor,
        ));
        registry.insert(uids, Watcher { job, handle });
        true
    }

    /// Whether a watcher for exactly this uid set is still running
    pub fn is_watching(&self, uids: &UidSet) -> bool {
        self.registry()
            .get(uids)
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Id of the job watched for a uid set, once it has been submitted or found
    pub fn watched_job(&self, uids: &UidSet) -> Option<String> {
        let registry = self.registry();
        let watcher = registry.get(uids)?;
        let job = watcher
            .job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = job.as_ref().map(|(id, _)| id.clone());
        id
    }

    /// Wait for every watcher to finish and collect their outcomes
    pub async fn join_all(&self) -> Vec<WatchOutcome> {
        let watchers: Vec<Watcher> = self.registry().drain().map(|(_, w)| w).collect();

        let mut outcomes = Vec::with_capacity(watchers.len());
        for watcher in watchers {
            match watcher.handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "job watcher panicked"),
            }
        }
        outcomes
    }

    /// Drop watchers whose job has finished; their outcome was already
    /// reported through events
    fn prune_finished(&self) {
        self.registry().retain(|uids, watcher| {
            let running = !watcher.handle.is_finished();
            if !running {
                tracing::debug!(nodes = uids.len(), "removing finished watcher");
            }
            running
        });
    }

    /// Stored token, checked against the provider.
    ///
    /// A rejected token is invalidated so the host asks for a new one.
    async fn check_token(&self) -> ServiceResult<String> {
        let Some(token) = self.gateway.token().await else {
            return Err(ServiceError::Credential(
                "no access token available, please provide one".to_string(),
            ));
        };
        if !self.gateway.is_valid(&token).await {
            self.gateway.invalidate().await;
            return Err(ServiceError::Credential(
                "the access token was rejected, please provide a new one".to_string(),
            ));
        }
        Ok(token)
    }

    /// Report a running watcher for `uids` instead of submitting again
    fn resume_watched(&self, uids: &UidSet) -> bool {
        let mut registry = self.registry();
        let Some(watcher) = registry.get(uids) else {
            return false;
        };
        if watcher.handle.is_finished() {
            registry.remove(uids);
            return false;
        }

        let job = watcher
            .job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match job {
            Some((job_id, job_name)) => {
                tracing::info!(job_id = %job_id, "resuming existing job");
                self.event_tx
                    .send_event(OffloadEvent::ResumingExisting { job_id, job_name });
            }
            None => self.event_tx.send_event(OffloadEvent::info(
                "A submission for the same nodes is already in progress",
                None,
            )),
        }
        true
    }

    /// Local preconditions: partition the graph and write its sanitized copy
    fn prepare(
        &self,
        graph: &DependencyGraph,
        graph_file: &Path,
        label: &str,
    ) -> ServiceResult<JobDescriptor> {
        let partition = Partitioner::by_flag().partition(graph)?;
        tracing::info!(runs = partition.len(), partition = %partition.summary(), "graph partitioned");

        let descriptor = DescriptorBuilder::new(self.config.clone()).build(
            label,
            graph,
            &partition,
            graph_file,
            None,
        )?;
        Ok(descriptor)
    }

    fn reject(&self, error: ServiceError) {
        if error.is_precondition() {
            tracing::warn!(reason = %error, "submission rejected");
        } else {
            tracing::error!(error = %error, "submission failed");
        }
        self.event_tx
            .send_event(OffloadEvent::error(error.to_string(), None));
    }
}

/// State moved into a background job task
struct JobContext {
    config: OffloadConfig,
    gateway: Arc<dyn CredentialGateway>,
    provider: Arc<dyn RemoteProvider>,
    event_tx: Option<ProgressSender>,
    job: JobSlot,
    token: String,
    uids: UidSet,
    nodes: Vec<Node>,
}

impl JobContext {
    fn record_job(&self, job_id: &str, job_name: &str) {
        let mut slot = self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some((job_id.to_string(), job_name.to_string()));
    }

    async fn fail(&self, descriptor: &JobDescriptor, error: RemoteError) -> WatchOutcome {
        if matches!(error, RemoteError::Unauthorized(_)) {
            self.gateway.invalidate().await;
        }
        discard(&descriptor.tmp_file);

        let message = format!("Remote submission failed: {}", error);
        tracing::error!(error = %error, "remote submission failed");
        self.event_tx.send_event(OffloadEvent::error(message.clone(), None));
        WatchOutcome {
            job_id: String::new(),
            state: JobState::Unsubmitted,
            error: Some(message),
            synced_files: 0,
        }
    }
}

/// Reattach to a running job for the same nodes, or submit a new one, then
/// watch it to the end
async fn run_job(ctx: JobContext, descriptor: JobDescriptor) -> WatchOutcome {
    let session = match ctx.provider.connect(&ctx.token).await {
        Ok(session) => session,
        Err(e) => return ctx.fail(&descriptor, e).await,
    };

    let mut manager = LifecycleManager::new(ctx.config.clone(), session);
    if let Some(tx) = &ctx.event_tx {
        manager = manager.with_progress(tx.clone());
    }

    let job = match manager.find_existing(&ctx.uids).await {
        Ok(Some(job)) => {
            tracing::info!(job_id = job.id(), "resuming existing job");
            ctx.event_tx.send_event(OffloadEvent::ResumingExisting {
                job_id: job.id().to_string(),
                job_name: job.name().to_string(),
            });
            discard(&descriptor.tmp_file);
            job
        }
        Ok(None) => match manager.submit(&descriptor).await {
            Ok(job) => job,
            Err(e) => return ctx.fail(&descriptor, e).await,
        },
        Err(e) => return ctx.fail(&descriptor, e).await,
    };

    ctx.record_job(job.id(), job.name());
    manager.watch(job, ctx.nodes.clone()).await
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary graph");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::StaticTokenGateway;
    use crate::events::{progress_channel, ProgressReceiver};
    use crate::remote::memory::InMemoryCluster;
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Project {
        _dir: tempfile::TempDir,
        graph_file: PathBuf,
        config: OffloadConfig,
    }

    fn project(poll_interval_ms: u64) -> Project {
        let dir = tempfile::tempdir().unwrap();
        let graph_file = dir.path().join("scan.mg");
        let image = dir.path().join("IMG_1.jpg");
        fs::write(&image, "jpeg").unwrap();
        let document = json!({
            "graph": {
                "Init": {
                    "nodeType": "CameraInit",
                    "uid": "u1",
                    "inputs": { "viewpoints": [{ "path": image.to_string_lossy() }] }
                },
                "Dense": { "nodeType": "DepthMap", "uid": "u2", "inputs": { "input": "{Init.output}" } },
                "Export": { "nodeType": "Texturing", "uid": "u3", "inputs": { "input": "{Dense.output}" } }
            }
        });
        fs::write(&graph_file, document.to_string()).unwrap();

        let config = OffloadConfig {
            temp_dir: dir.path().join("tmp"),
            poll_interval_ms,
            ..OffloadConfig::default()
        };
        Project {
            _dir: dir,
            graph_file,
            config,
        }
    }

    fn nodes() -> Vec<Node> {
        vec![
            Node::new("Init", "CameraInit", "u1", false),
            Node::new("Dense", "DepthMap", "u2", true),
            Node::new("Export", "Texturing", "u3", false),
        ]
    }

    fn edges() -> Vec<Edge> {
        vec![Edge::new("Init", "Dense"), Edge::new("Dense", "Export")]
    }

    fn uids() -> UidSet {
        ["u1", "u2", "u3"].iter().map(|s| s.to_string()).collect()
    }

    fn slow_cluster() -> InMemoryCluster {
        InMemoryCluster::new(["tok"])
            .with_script(vec![
                JobState::FullyDispatched,
                JobState::FullyExecuting,
                JobState::FullyExecuting,
                JobState::FullyExecuting,
                JobState::FullyExecuting,
                JobState::Success,
            ])
            .with_node_outputs("MeshroomCache")
    }

    fn offloader(
        project: &Project,
        cluster: &InMemoryCluster,
        token: Option<&str>,
    ) -> (Offloader, ProgressReceiver) {
        let provider: Arc<dyn RemoteProvider> = Arc::new(cluster.clone());
        let gateway = StaticTokenGateway::new(token.map(str::to_string))
            .with_provider(provider.clone());
        let (tx, rx) = progress_channel();
        let offloader = Offloader::new(project.config.clone(), Arc::new(gateway), provider)
            .with_progress(tx);
        (offloader, rx)
    }

    async fn wait_for_job(offloader: &Offloader) -> String {
        for _ in 0..500 {
            if let Some(id) = offloader.watched_job(&uids()) {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("job was never submitted");
    }

    fn drain(mut rx: ProgressReceiver) -> Vec<OffloadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_end_to_end_single_job_and_resume() {
        let project = project(20);
        let cluster = slow_cluster();
        let (offloader, rx) = offloader(&project, &cluster, Some("tok"));

        assert!(offloader.submit(nodes(), edges(), &project.graph_file, "meshroom-task").await);
        let job_id = wait_for_job(&offloader).await;
        assert!(offloader.is_watching(&uids()));

        // Same node set while the job runs: no new job
        assert!(offloader.submit(nodes(), edges(), &project.graph_file, "meshroom-task").await);
        assert_eq!(cluster.job_count(), 1);

        let outcomes = offloader.join_all().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded());
        assert_eq!(outcomes[0].job_id, job_id);

        let specs = cluster.submitted_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].tags, uids());
        assert_eq!(specs[0].name, "meshroom-task (scan.mg)");

        drop(offloader);
        let events = drain(rx);
        assert!(events.iter().any(|e| matches!(
            e,
            OffloadEvent::ResumingExisting { job_id: id, .. } if *id == job_id
        )));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, OffloadEvent::JobSubmitted { .. }))
                .count(),
            1
        );
        assert_eq!(cluster.job_state(&job_id), Some(JobState::Success));
    }

    #[tokio::test]
    async fn test_reattach_after_restart() {
        let project = project(20);
        let cluster = slow_cluster();

        let (first, _rx) = offloader(&project, &cluster, Some("tok"));
        assert!(first.submit(nodes(), edges(), &project.graph_file, "scan").await);
        let job_id = wait_for_job(&first).await;

        // A fresh process has an empty registry but finds the job by its tags
        let (second, rx) = offloader(&project, &cluster, Some("tok"));
        assert!(second.submit(nodes(), edges(), &project.graph_file, "scan").await);
        assert_eq!(wait_for_job(&second).await, job_id);

        second.join_all().await;
        first.join_all().await;
        assert_eq!(cluster.job_count(), 1);

        drop(second);
        let events = drain(rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, OffloadEvent::ResumingExisting { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, OffloadEvent::JobSubmitted { .. })));
    }

    #[tokio::test]
    async fn test_missing_token_rejects() {
        let project = project(1);
        let cluster = InMemoryCluster::new(["tok"]);
        let (offloader, rx) = offloader(&project, &cluster, None);

        assert!(!offloader.submit(nodes(), edges(), &project.graph_file, "job").await);
        assert_eq!(cluster.job_count(), 0);
        assert!(!offloader.is_watching(&uids()));

        drop(offloader);
        assert!(drain(rx).iter().any(|e| matches!(
            e,
            OffloadEvent::Log { level: crate::events::LogLevel::Error, message, .. }
                if message.starts_with("credential error: no access token")
        )));
    }

    #[tokio::test]
    async fn test_invalid_token_is_invalidated() {
        let project = project(1);
        let cluster = InMemoryCluster::new(["tok"]);
        let provider: Arc<dyn RemoteProvider> = Arc::new(cluster.clone());
        let gateway = Arc::new(
            StaticTokenGateway::new(Some("expired".to_string())).with_provider(provider.clone()),
        );
        let offloader = Offloader::new(project.config.clone(), gateway.clone(), provider);

        assert!(!offloader.submit(nodes(), edges(), &project.graph_file, "job").await);
        assert!(gateway.token().await.is_none());
        assert_eq!(cluster.job_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_watchers_are_pruned() {
        let project = project(1);
        let cluster = InMemoryCluster::new(["tok"]);
        let (offloader, _rx) = offloader(&project, &cluster, Some("tok"));

        assert!(offloader.submit(nodes(), edges(), &project.graph_file, "full").await);
        for _ in 0..500 {
            if !offloader.is_watching(&uids()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(!offloader.is_watching(&uids()));

        // A different node set: the finished watcher is dropped from the registry
        let init = vec![Node::new("Init", "CameraInit", "u1", false)];
        assert!(offloader.submit(init, Vec::new(), &project.graph_file, "init").await);

        let outcomes = offloader.join_all().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded());
        assert_eq!(cluster.job_count(), 2);
    }

    #[tokio::test]
    async fn test_cyclic_graph_rejected_before_submission() {
        let project = project(1);
        let cluster = InMemoryCluster::new(["tok"]);
        let (offloader, _rx) = offloader(&project, &cluster, Some("tok"));

        let mut cyclic = edges();
        cyclic.push(Edge::new("Export", "Dense"));
        assert!(!offloader.submit(nodes(), cyclic, &project.graph_file, "job").await);
        assert_eq!(cluster.job_count(), 0);
        assert!(offloader.join_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_graph_file_rejected() {
        let project = project(1);
        let cluster = InMemoryCluster::new(["tok"]);
        let (offloader, _rx) = offloader(&project, &cluster, Some("tok"));

        assert!(!offloader.submit(nodes(), edges(), "/no/such/scan.mg", "job").await);
        assert_eq!(cluster.job_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_is_reported_not_returned() {
        let project = project(1);
        let cluster = InMemoryCluster::new(["tok"]).with_failure("license server unreachable");
        let (offloader, rx) = offloader(&project, &cluster, Some("tok"));

        assert!(offloader.submit(nodes(), edges(), &project.graph_file, "job").await);
        let outcomes = offloader.join_all().await;
        assert_eq!(outcomes[0].state, JobState::Failure);

        drop(offloader);
        assert!(drain(rx).iter().any(|e| matches!(
            e,
            OffloadEvent::JobFinished { error: Some(msg), .. } if msg == "license server unreachable"
        )));
    }
}
