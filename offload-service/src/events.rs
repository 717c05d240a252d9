// Offload Events
// Progress reporting for submissions and the background job watchers

use crate::remote::JobState;

use tokio::sync::mpsc;

/// Sender for offload progress events
pub type ProgressSender = mpsc::UnboundedSender<OffloadEvent>;

/// Receiver for offload progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<OffloadEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while submitting and watching remote jobs
#[derive(Debug, Clone, PartialEq)]
pub enum OffloadEvent {
    /// A new job was transmitted to the provider
    JobSubmitted {
        job_id: String,
        job_name: String,
        node_count: usize,
    },

    /// A job for the same node set is already running; it is reattached instead
    ResumingExisting { job_id: String, job_name: String },

    /// The remote job moved to another state
    StateChanged {
        job_id: String,
        state: JobState,
        notice: Option<String>,
    },

    /// Fresh standard output or error text, forwarded as received
    Output {
        job_id: String,
        text: String,
        is_error: bool,
    },

    /// Resource usage of the running instance
    Usage {
        job_id: String,
        cpu_percent: f64,
        memory_mb: f64,
    },

    /// The local/remote cache directory map was (re)built
    UidMapBuilt { job_id: String, entries: usize },

    /// Remote artifacts were copied into the local cache
    ArtifactsSynced {
        job_id: String,
        files: usize,
        is_final: bool,
    },

    /// The job reached a terminal state or its watcher stopped
    JobFinished {
        job_id: String,
        state: JobState,
        error: Option<String>,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        job_id: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl OffloadEvent {
    /// Create a state change event with its human-readable notice
    pub fn state_changed(job_id: impl Into<String>, state: JobState) -> Self {
        Self::StateChanged {
            job_id: job_id.into(),
            state,
            notice: state.notice().map(str::to_string),
        }
    }

    /// Create an output event
    pub fn output(job_id: impl Into<String>, text: impl Into<String>, is_error: bool) -> Self {
        Self::Output {
            job_id: job_id.into(),
            text: text.into(),
            is_error,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job_id,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_id,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            job_id,
        }
    }

    /// Job this event refers to, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobSubmitted { job_id, .. }
            | Self::ResumingExisting { job_id, .. }
            | Self::StateChanged { job_id, .. }
            | Self::Output { job_id, .. }
            | Self::Usage { job_id, .. }
            | Self::UidMapBuilt { job_id, .. }
            | Self::ArtifactsSynced { job_id, .. }
            | Self::JobFinished { job_id, .. } => Some(job_id),
            Self::Log { job_id, .. } => job_id.as_deref(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: OffloadEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: OffloadEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: OffloadEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(OffloadEvent::info("preparing", None));
        tx.send_event(OffloadEvent::state_changed("job-1", JobState::Submitted));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, OffloadEvent::Log { level: LogLevel::Info, .. }));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.job_id(), Some("job-1"));
    }

    #[test]
    fn test_state_change_carries_notice() {
        match OffloadEvent::state_changed("job-1", JobState::FullyDispatched) {
            OffloadEvent::StateChanged { notice, .. } => {
                assert!(notice.unwrap().contains("start"));
            }
            other => panic!("wrong event type: {:?}", other),
        }

        match OffloadEvent::state_changed("job-1", JobState::Success) {
            OffloadEvent::StateChanged { notice, .. } => assert!(notice.is_none()),
            other => panic!("wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(OffloadEvent::warning("dropped", None));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(OffloadEvent::error("nobody listens", Some("job-2".to_string())));
    }
}
