// Job Module
// Building job descriptors and driving remote jobs

pub mod descriptor;
pub mod lifecycle;

// Re-export key types
pub use descriptor::{DescriptorBuilder, JobDescriptor};
pub use lifecycle::{LifecycleManager, WatchOutcome};
