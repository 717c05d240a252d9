// Service Errors
// Error taxonomy shared by the orchestrator components

use crate::config::ConfigError;
use crate::graph::document::GraphFileError;
use crate::graph::model::GraphError;
use crate::graph::partition::PartitionError;
use crate::remote::RemoteError;

use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised by the orchestrator.
///
/// Credential, graph file and partition errors are local preconditions and
/// abort a submission synchronously. The remaining variants are produced
/// after a job exists and only travel through the progress channel.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("credential error: {0}")]
    Credential(String),

    #[error(transparent)]
    GraphFile(#[from] GraphFileError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("remote error: {0}")]
    RemoteTransient(RemoteError),

    #[error("remote job failed: {0}")]
    RemoteFatal(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Whether this error was raised before anything reached the remote side
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ServiceError::Credential(_)
                | ServiceError::GraphFile(_)
                | ServiceError::Graph(_)
                | ServiceError::Partition(_)
                | ServiceError::Config(_)
        )
    }
}

impl From<RemoteError> for ServiceError {
    fn from(err: RemoteError) -> Self {
        if err.is_fatal() {
            ServiceError::RemoteFatal(err.to_string())
        } else {
            ServiceError::RemoteTransient(err)
        }
    }
}
