// Job Lifecycle Manager
// Submits jobs, finds running ones and polls them until they finish

use crate::config::OffloadConfig;
use crate::events::{EventSender, OffloadEvent, ProgressSender};
use crate::graph::model::{Node, UidSet};
use crate::job::descriptor::{JobDescriptor, LABEL_FILEPATH, LABEL_TMP_FILEPATH};
use crate::remote::{JobState, RemoteError, RemoteJob, RemoteSession};
use crate::sync::CacheSynchronizer;

use std::path::PathBuf;

/// How a watched job ended
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOutcome {
    pub job_id: String,
    /// Last observed state
    pub state: JobState,
    /// First remote error, or the reason polling stopped
    pub error: Option<String>,
    /// Files downloaded by the final pull
    pub synced_files: usize,
}

impl WatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Success && self.error.is_none()
    }
}

/// Drives remote jobs through their lifecycle
pub struct LifecycleManager {
    config: OffloadConfig,
    session: RemoteSession,
    event_tx: Option<ProgressSender>,
}

impl LifecycleManager {
    pub fn new(config: OffloadConfig, session: RemoteSession) -> Self {
        Self {
            config,
            session,
            event_tx: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// First non-terminal job whose tags cover every uid of `uids`
    pub async fn find_existing(
        &self,
        uids: &UidSet,
    ) -> Result<Option<Box<dyn RemoteJob>>, RemoteError> {
        let jobs = self.session.compute.list_jobs(&JobState::ACTIVE).await?;
        Ok(jobs.into_iter().find(|job| uids.is_subset(job.tags())))
    }

    /// Upload the inputs and transmit the job.
    ///
    /// The output bucket is recreated empty so results of an earlier job
    /// cannot be mistaken for this one's.
    pub async fn submit(&self, descriptor: &JobDescriptor) -> Result<Box<dyn RemoteJob>, RemoteError> {
        let storage = &self.session.storage;

        let input = storage.get_or_create_bucket(&self.config.input_bucket).await?;
        storage.delete_bucket(&self.config.output_bucket).await?;
        storage.get_or_create_bucket(&self.config.output_bucket).await?;

        let uploaded = input.sync_upload(&descriptor.manifest).await?;
        tracing::info!(
            bucket = %self.config.input_bucket,
            files = uploaded,
            "input files uploaded"
        );

        let mut job = self
            .session
            .compute
            .create_job(descriptor.to_spec(&self.config))
            .await?;
        job.submit().await?;

        tracing::info!(job_id = job.id(), name = job.name(), profile = %descriptor.profile, "job submitted");
        self.event_tx.send_event(OffloadEvent::JobSubmitted {
            job_id: job.id().to_string(),
            job_name: job.name().to_string(),
            node_count: descriptor.tags.len(),
        });

        Ok(job)
    }

    /// Poll a job until it reaches a terminal state.
    ///
    /// Output is forwarded as it arrives, results are pulled while the job
    /// executes and once more after success. Transient status errors are
    /// reported and polling continues; an authorization failure stops it.
    /// The graph file paths are read back from the job labels so a job found
    /// by `find_existing` is watched the same way as a fresh one.
    pub async fn watch(&self, mut job: Box<dyn RemoteJob>, nodes: Vec<Node>) -> WatchOutcome {
        let job_id = job.id().to_string();

        let (graph_file, tmp_file) = match job_paths(job.as_ref()) {
            Some(paths) => paths,
            None => {
                let message = "job labels do not locate the graph files".to_string();
                return self.finish(&job_id, job.state(), Some(message), 0);
            }
        };

        let bucket = match self
            .session
            .storage
            .get_or_create_bucket(&self.config.output_bucket)
            .await
        {
            Ok(bucket) => bucket,
            Err(e) => return self.finish(&job_id, job.state(), Some(e.to_string()), 0),
        };

        let mut sync = CacheSynchronizer::new(&self.config, bucket, nodes, &graph_file, tmp_file);
        let interval = self.config.poll_interval();
        let mut last_state: Option<JobState> = None;
        let mut errors: Vec<String> = Vec::new();
        let mut usage = None;
        let mut snapshot_warned = false;

        loop {
            match job.refresh_status().await {
                Ok(status) => {
                    errors = status.errors;
                    usage = status.usage;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(job_id = %job_id, error = %e, "polling stopped");
                    return self.finish(&job_id, job.state(), Some(e.to_string()), 0);
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "error retrieving job status");
                    self.event_tx.send_event(OffloadEvent::warning(
                        format!("Error retrieving job status: {}", e),
                        Some(job_id.clone()),
                    ));
                }
            }

            self.forward_output(job.as_mut(), &job_id).await;

            let state = job.state();
            if last_state != Some(state) {
                last_state = Some(state);
                tracing::info!(job_id = %job_id, state = %state, "job state changed");
                self.event_tx
                    .send_event(OffloadEvent::state_changed(job_id.clone(), state));
            }

            match state {
                JobState::FullyExecuting => {
                    // Retried every poll until the snapshot can be read
                    if sync.uid_map().is_none() {
                        match sync.refresh_snapshot().await {
                            Ok(entries) => self.event_tx.send_event(OffloadEvent::UidMapBuilt {
                                job_id: job_id.clone(),
                                entries,
                            }),
                            Err(e) if !snapshot_warned => {
                                snapshot_warned = true;
                                self.event_tx.send_event(OffloadEvent::warning(
                                    format!("Remote graph snapshot not available yet: {}", e),
                                    Some(job_id.clone()),
                                ));
                            }
                            Err(e) => {
                                tracing::debug!(job_id = %job_id, error = %e, "snapshot still unavailable")
                            }
                        }
                    }
                    if let Some(usage) = usage.take() {
                        self.event_tx.send_event(OffloadEvent::Usage {
                            job_id: job_id.clone(),
                            cpu_percent: usage.cpu_percent,
                            memory_mb: usage.memory_mb,
                        });
                    }
                    match sync.pull_incremental().await {
                        Ok(files) if files > 0 => {
                            self.event_tx.send_event(OffloadEvent::ArtifactsSynced {
                                job_id: job_id.clone(),
                                files,
                                is_final: false,
                            })
                        }
                        Ok(_) => {}
                        Err(e) => self.event_tx.send_event(OffloadEvent::warning(
                            format!("Incremental download skipped: {}", e),
                            Some(job_id.clone()),
                        )),
                    }
                }
                JobState::Failure => {
                    let error = errors
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "job failed without an error message".to_string());
                    tracing::error!(job_id = %job_id, error = %error, "job failed");
                    sync.discard_tmp_file().await;
                    return self.finish(&job_id, state, Some(error), 0);
                }
                JobState::Success => {
                    let (files, error) = match sync.pull_final().await {
                        Ok(files) => (files, None),
                        Err(e) => (0, Some(e.to_string())),
                    };
                    self.event_tx.send_event(OffloadEvent::ArtifactsSynced {
                        job_id: job_id.clone(),
                        files,
                        is_final: true,
                    });
                    return self.finish(&job_id, state, error, files);
                }
                _ => {}
            }

            if let Err(e) = job.wait(interval).await {
                tracing::debug!(job_id = %job_id, error = %e, "wait failed, sleeping instead");
                tokio::time::sleep(interval).await;
            }
        }
    }

    async fn forward_output(&self, job: &mut dyn RemoteJob, job_id: &str) {
        match job.fresh_stdout().await {
            Ok(text) if !text.is_empty() => {
                self.event_tx
                    .send_event(OffloadEvent::output(job_id, text, false))
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(job_id, error = %e, "stdout unavailable"),
        }
        match job.fresh_stderr().await {
            Ok(text) if !text.is_empty() => {
                self.event_tx
                    .send_event(OffloadEvent::output(job_id, text, true))
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(job_id, error = %e, "stderr unavailable"),
        }
    }

    fn finish(
        &self,
        job_id: &str,
        state: JobState,
        error: Option<String>,
        synced_files: usize,
    ) -> WatchOutcome {
        self.event_tx.send_event(OffloadEvent::JobFinished {
            job_id: job_id.to_string(),
            state,
            error: error.clone(),
        });
        WatchOutcome {
            job_id: job_id.to_string(),
            state,
            error,
            synced_files,
        }
    }
}

/// Local graph file and sanitized copy recorded on the job
fn job_paths(job: &dyn RemoteJob) -> Option<(PathBuf, PathBuf)> {
    let labels = job.labels();
    let graph_file = labels.get(LABEL_FILEPATH)?;
    let tmp_file = labels.get(LABEL_TMP_FILEPATH)?;
    Some((PathBuf::from(graph_file), PathBuf::from(tmp_file)))
}
