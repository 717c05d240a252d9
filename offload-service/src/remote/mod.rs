// Remote Compute Seams
// Job states and the traits the orchestrator uses to reach a compute provider

pub mod memory;

use crate::graph::model::UidSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle state of a remote job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Built locally, not yet transmitted
    Unsubmitted,
    Submitted,
    FullyDispatched,
    FullyExecuting,
    Success,
    Failure,
}

impl JobState {
    /// States in which a job may still produce results
    pub const ACTIVE: [JobState; 3] = [
        JobState::Submitted,
        JobState::FullyDispatched,
        JobState::FullyExecuting,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    /// Explanation shown to the user while the job waits on the provider
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            JobState::Submitted => {
                Some("Waiting for the job to be dispatched to the compute cluster (this may take a few minutes)")
            }
            JobState::FullyDispatched => {
                Some("Waiting for the job to start executing (this may take a few minutes)")
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Unsubmitted => "Unsubmitted",
            JobState::Submitted => "Submitted",
            JobState::FullyDispatched => "FullyDispatched",
            JobState::FullyExecuting => "FullyExecuting",
            JobState::Success => "Success",
            JobState::Failure => "Failure",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and memory of the running instance
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Result of one status refresh
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    /// Errors reported by the provider, first one is the most relevant
    pub errors: Vec<String>,
    /// Present while an instance is running
    pub usage: Option<ResourceUsage>,
}

/// Capacity class requested for a job.
///
/// Only reserved capacity is requested: a preempted job would lose the
/// progress of a long reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheduling {
    OnDemand,
}

/// Everything a provider needs to create a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub profile: String,
    pub constants: BTreeMap<String, String>,
    /// Uids of every node the job computes
    pub tags: UidSet,
    /// Local bookkeeping carried with the job for later reattachment
    pub labels: BTreeMap<String, String>,
    /// Input bucket names, mounted in the job
    pub resources: Vec<String>,
    /// Output bucket name
    pub results: String,
    pub scheduling: Scheduling,
    /// Files the provider copies into the results bucket while running
    pub snapshot_whitelist: Option<String>,
}

/// Errors returned by the provider seams
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rejected by provider: {0}")]
    Rejected(String),

    #[error("Local file error: {0}")]
    LocalIo(String),
}

impl RemoteError {
    /// Errors that retrying cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Unauthorized(_) | RemoteError::Rejected(_))
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::LocalIo(err.to_string())
    }
}

/// Authenticated handles to the provider's compute and storage services
#[derive(Clone)]
pub struct RemoteSession {
    pub compute: Arc<dyn ComputeClient>,
    pub storage: Arc<dyn StorageClient>,
}

/// Entry point of a provider
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Open a session, failing with `Unauthorized` for a rejected token
    async fn connect(&self, token: &str) -> Result<RemoteSession, RemoteError>;
}

/// Job listing and creation
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Jobs currently in one of `states`, oldest first
    async fn list_jobs(&self, states: &[JobState]) -> Result<Vec<Box<dyn RemoteJob>>, RemoteError>;

    /// Create an unsubmitted job from a spec
    async fn create_job(&self, spec: JobSpec) -> Result<Box<dyn RemoteJob>, RemoteError>;
}

/// Handle to one remote job
#[async_trait]
pub trait RemoteJob: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn tags(&self) -> &UidSet;

    fn labels(&self) -> &BTreeMap<String, String>;

    /// Last state observed by `refresh_status`
    fn state(&self) -> JobState;

    /// Transmit the job to the provider
    async fn submit(&mut self) -> Result<(), RemoteError>;

    /// Fetch the current status from the provider
    async fn refresh_status(&mut self) -> Result<JobStatus, RemoteError>;

    /// Standard output produced since the last call
    async fn fresh_stdout(&mut self) -> Result<String, RemoteError>;

    /// Standard error produced since the last call
    async fn fresh_stderr(&mut self) -> Result<String, RemoteError>;

    /// Wait up to `timeout` for the job to finish; true when it did
    async fn wait(&mut self, timeout: Duration) -> Result<bool, RemoteError>;
}

/// Bucket management
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn get_or_create_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, RemoteError>;

    /// Delete a bucket and its content; deleting a missing bucket succeeds
    async fn delete_bucket(&self, name: &str) -> Result<(), RemoteError>;
}

/// File transfers against one bucket
#[async_trait]
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    /// Upload local files under their remote names; returns the number uploaded
    async fn sync_upload(&self, files: &BTreeMap<String, PathBuf>) -> Result<usize, RemoteError>;

    /// Mirror every file under `remote_dir` into `local_dir`.
    ///
    /// A missing remote directory downloads nothing.
    async fn sync_download(&self, remote_dir: &str, local_dir: &Path) -> Result<usize, RemoteError>;

    /// Download one file
    async fn fetch_file(&self, remote_name: &str, local_path: &Path) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failure.is_terminal());
        assert!(!JobState::FullyExecuting.is_terminal());
    }

    #[test]
    fn test_notices() {
        assert!(JobState::Submitted.notice().unwrap().contains("dispatched"));
        assert!(JobState::FullyExecuting.notice().is_none());
        assert_eq!(JobState::FullyDispatched.to_string(), "FullyDispatched");
    }

    #[test]
    fn test_remote_error_fatality() {
        assert!(RemoteError::Unauthorized("expired".into()).is_fatal());
        assert!(RemoteError::Rejected("no credits".into()).is_fatal());
        assert!(!RemoteError::Transport("reset".into()).is_fatal());
        assert!(!RemoteError::NotFound("bucket".into()).is_fatal());
    }
}
