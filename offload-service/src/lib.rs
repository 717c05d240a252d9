// Offload Service Library
// Partitions photogrammetry graphs, runs them on a remote cluster and syncs results back

pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod graph;
pub mod job;
pub mod orchestrator;
pub mod remote;
pub mod sync;

// Re-export commonly used types
pub use config::{ConfigError, OffloadConfig};
pub use error::{ServiceError, ServiceResult};
pub use events::{
    progress_channel, EventSender, LogLevel, OffloadEvent, ProgressReceiver, ProgressSender,
};

// Re-export graph types
pub use graph::{
    DependencyGraph, Edge, GraphDocument, GraphError, GraphFileError, Node, NodeSummary,
    Partition, PartitionEntry, PartitionError, PartitionErrorKind, Partitioner, UidSet,
};

// Re-export job types
pub use job::{DescriptorBuilder, JobDescriptor, LifecycleManager, WatchOutcome};

// Re-export remote types
pub use credential::{CredentialGateway, StaticTokenGateway};
pub use remote::memory::InMemoryCluster;
pub use remote::{JobSpec, JobState, JobStatus, RemoteError, RemoteProvider, RemoteSession};

pub use orchestrator::Offloader;
pub use sync::{build_uid_map, CacheSynchronizer, UidMap, UidMapping};
