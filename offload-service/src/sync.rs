// Cache Synchronizer
// Maps local node cache directories to remote paths and pulls results back

use crate::config::OffloadConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::graph::document::{GraphDocument, NodeSummary};
use crate::graph::model::Node;
use crate::remote::Bucket;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One local/remote node output directory pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidMapping {
    pub node: String,
    pub local_dir: PathBuf,
    pub remote_dir: String,
}

/// Output directory pairs of every node present on both sides
pub type UidMap = Vec<UidMapping>;

/// Pair local and remote nodes by name and create the local directories.
///
/// Local nodes missing from the remote snapshot are skipped; remote uids
/// may differ from local ones.
pub fn build_uid_map(
    local_nodes: &[Node],
    remote_nodes: &[NodeSummary],
    cache_root: &Path,
    remote_cache_root: &str,
) -> std::io::Result<UidMap> {
    let remote_by_name: HashMap<&str, &NodeSummary> = remote_nodes
        .iter()
        .map(|n| (n.name.as_str(), n))
        .collect();
    let remote_cache_root = remote_cache_root.trim_end_matches('/');

    let mut map = Vec::new();
    for local in local_nodes {
        let Some(remote) = remote_by_name.get(local.name.as_str()) else {
            tracing::debug!(node = %local.name, "node absent from remote snapshot");
            continue;
        };

        let local_dir = cache_root.join(&local.node_type).join(&local.uid);
        std::fs::create_dir_all(&local_dir)?;

        map.push(UidMapping {
            node: local.name.clone(),
            local_dir,
            remote_dir: format!("{}/{}/{}", remote_cache_root, remote.node_type, remote.uid),
        });
    }

    Ok(map)
}

/// Keeps the local cache of one job in step with its results bucket
pub struct CacheSynchronizer {
    bucket: Arc<dyn Bucket>,
    nodes: Vec<Node>,
    cache_root: PathBuf,
    remote_cache_root: String,
    tmp_file: PathBuf,
    uid_map: Option<UidMap>,
}

impl CacheSynchronizer {
    /// `graph_file` locates the local cache, `tmp_file` is the sanitized
    /// copy uploaded with the job
    pub fn new(
        config: &OffloadConfig,
        bucket: Arc<dyn Bucket>,
        nodes: Vec<Node>,
        graph_file: &Path,
        tmp_file: PathBuf,
    ) -> Self {
        let cache_root = graph_file
            .parent()
            .map(|dir| dir.join(&config.cache_dir_name))
            .unwrap_or_else(|| PathBuf::from(&config.cache_dir_name));

        Self {
            bucket,
            nodes,
            cache_root,
            remote_cache_root: config.remote_cache_root.clone(),
            tmp_file,
            uid_map: None,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn uid_map(&self) -> Option<&UidMap> {
        self.uid_map.as_ref()
    }

    fn tmp_name(&self) -> String {
        self.tmp_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Fetch the job's graph snapshot and rebuild the uid map from it.
    ///
    /// Returns the number of mapped nodes.
    pub async fn refresh_snapshot(&mut self) -> ServiceResult<usize> {
        self.bucket
            .fetch_file(&self.tmp_name(), &self.tmp_file)
            .await?;

        let snapshot = GraphDocument::load(&self.tmp_file)?;
        let remote_nodes = snapshot.node_summaries()?;
        let map = build_uid_map(
            &self.nodes,
            &remote_nodes,
            &self.cache_root,
            &self.remote_cache_root,
        )?;

        let count = map.len();
        tracing::info!(mapped = count, "uid map built");
        self.uid_map = Some(map);
        Ok(count)
    }

    /// Pull whatever the job has produced so far.
    ///
    /// Does nothing until the uid map exists. Every pair is attempted even
    /// when some fail.
    pub async fn pull_incremental(&self) -> ServiceResult<usize> {
        match &self.uid_map {
            Some(map) => self.pull(map).await,
            None => Ok(0),
        }
    }

    /// Final transfer after the job succeeded, then removal of the
    /// sanitized graph copy.
    ///
    /// The snapshot is fetched again so a map is available even when the
    /// job was never observed executing.
    pub async fn pull_final(&mut self) -> ServiceResult<usize> {
        if let Err(e) = self.refresh_snapshot().await {
            tracing::warn!(error = %e, "could not refresh graph snapshot before final pull");
        }

        let result = match &self.uid_map {
            Some(map) => self.pull(map).await,
            None => Err(ServiceError::Sync(
                "no uid map available, results were not downloaded".to_string(),
            )),
        };

        self.discard_tmp_file().await;
        result
    }

    /// Remove the sanitized graph copy, if still present
    pub async fn discard_tmp_file(&self) {
        match tokio::fs::remove_file(&self.tmp_file).await {
            Ok(()) => tracing::debug!(path = %self.tmp_file.display(), "temporary graph removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.tmp_file.display(),
                error = %e,
                "failed to remove temporary graph"
            ),
        }
    }

    async fn pull(&self, map: &UidMap) -> ServiceResult<usize> {
        let mut files = 0;
        let mut failures = Vec::new();

        for mapping in map {
            match self
                .bucket
                .sync_download(&mapping.remote_dir, &mapping.local_dir)
                .await
            {
                Ok(count) => files += count,
                Err(e) => {
                    tracing::warn!(node = %mapping.node, error = %e, "download failed");
                    failures.push(format!("{}: {}", mapping.node, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(files)
        } else {
            Err(ServiceError::Sync(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::InMemoryCluster;
    use crate::remote::StorageClient;

    fn local_nodes() -> Vec<Node> {
        vec![
            Node::new("Init", "CameraInit", "l1", false),
            Node::new("Dense", "DepthMap", "l2", true),
            Node::new("Local", "Publish", "l3", false),
        ]
    }

    fn remote_nodes() -> Vec<NodeSummary> {
        vec![
            NodeSummary {
                name: "Init".to_string(),
                node_type: "CameraInit".to_string(),
                uid: "r1".to_string(),
            },
            NodeSummary {
                name: "Dense".to_string(),
                node_type: "DepthMap".to_string(),
                uid: "r2".to_string(),
            },
        ]
    }

    #[test]
    fn test_build_uid_map() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("Cache");
        let map = build_uid_map(&local_nodes(), &remote_nodes(), &cache, "Remote/").unwrap();

        // Local-only node is left out
        assert_eq!(map.len(), 2);
        let dense = map.iter().find(|m| m.node == "Dense").unwrap();
        assert_eq!(dense.local_dir, cache.join("DepthMap").join("l2"));
        assert_eq!(dense.remote_dir, "Remote/DepthMap/r2");
        assert!(dense.local_dir.is_dir());
        assert!(!cache.join("Publish").exists());
    }

    const SNAPSHOT: &str = r#"{"graph": {
        "Init": {"nodeType": "CameraInit", "uid": "r1"},
        "Dense": {"nodeType": "DepthMap", "uid": "r2"}
    }}"#;

    struct Fixture {
        dir: tempfile::TempDir,
        cluster: InMemoryCluster,
        sync: CacheSynchronizer,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = OffloadConfig::default();
        let cluster = InMemoryCluster::new(["t"]);
        cluster.put_file("meshroomOut", "meshroom_abc.mg", SNAPSHOT);
        cluster.put_file("meshroomOut", "MeshroomCache/DepthMap/r2/depth.exr", "pixels");

        let bucket = cluster.get_or_create_bucket("meshroomOut").await.unwrap();
        let sync = CacheSynchronizer::new(
            &config,
            bucket,
            local_nodes(),
            &dir.path().join("project").join("scan.mg"),
            dir.path().join("tmp").join("meshroom_abc.mg"),
        );
        Fixture { dir, cluster, sync }
    }

    #[tokio::test]
    async fn test_incremental_waits_for_map() {
        let f = fixture().await;
        assert_eq!(f.sync.pull_incremental().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_then_incremental_pulls() {
        let mut f = fixture().await;
        assert_eq!(f.sync.refresh_snapshot().await.unwrap(), 2);
        assert_eq!(
            f.sync.cache_root().to_path_buf(),
            f.dir.path().join("project").join("MeshroomCache")
        );

        assert_eq!(f.sync.pull_incremental().await.unwrap(), 1);
        let pulled = f.sync.cache_root().join("DepthMap/l2/depth.exr");
        assert_eq!(std::fs::read_to_string(pulled).unwrap(), "pixels");

        // Repeated pulls are harmless
        assert_eq!(f.sync.pull_incremental().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_final_pull_after_failed_incrementals() {
        let mut f = fixture().await;
        f.sync.refresh_snapshot().await.unwrap();

        f.cluster.fail_downloads(2);
        assert!(f.sync.pull_incremental().await.is_err());

        let files = f.sync.pull_final().await.unwrap();
        assert_eq!(files, 1);
        assert!(!f.dir.path().join("tmp").join("meshroom_abc.mg").exists());
    }

    #[tokio::test]
    async fn test_final_pull_builds_missing_map() {
        let mut f = fixture().await;
        assert!(f.sync.uid_map().is_none());
        assert_eq!(f.sync.pull_final().await.unwrap(), 1);
        assert_eq!(f.sync.uid_map().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_final_pull_without_snapshot_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = InMemoryCluster::new(["t"]);
        let bucket = cluster.get_or_create_bucket("meshroomOut").await.unwrap();
        let tmp_file = dir.path().join("meshroom_gone.mg");
        std::fs::write(&tmp_file, "{}").unwrap();

        let mut sync = CacheSynchronizer::new(
            &OffloadConfig::default(),
            bucket,
            local_nodes(),
            &dir.path().join("scan.mg"),
            tmp_file.clone(),
        );
        let err = sync.pull_final().await.unwrap_err();
        assert!(matches!(err, ServiceError::Sync(_)));
        assert!(!tmp_file.exists());
    }
}
