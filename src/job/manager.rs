//! The job manager: job table, priority queue, metrics, and the public
//! submit/cancel/query/shutdown surface (spec §4.6, §5).
//!
//! Grounded on the teacher's `DefaultJobManager` (`kernel/jobs/manager.rs`)
//! for the trait-shaped public surface and on `JobWorker`
//! (`kernel/jobs/worker.rs`) for the `Arc<RwLock<HashMap<Uuid, ..>>>`
//! running-job bookkeeping and `CancellationToken` shutdown idiom.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::change_tracker::ChangeTracker;
use crate::error::{CoreError, Result};
use crate::provider::{ProviderConfig, ProviderRegistry};

use super::events::{JobEvent, LifecycleListener};
use super::model::{Job, JobPriority, JobStatus};
use super::queue::PriorityQueue;

/// The opaque-to-transport, meaningful-to-us payload every export job
/// carries: which provider to dispatch to, how to reach it, and what to
/// export. Stored on `Job::payload` as a `serde_json::Value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportPayload {
    pub provider_type: String,
    pub provider_config: ProviderConfig,
    pub vm_id: String,
    #[serde(default)]
    pub export_options: crate::provider::ExportOptions,
}

/// Caller-facing submission request.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobSubmission {
    pub name: String,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = Duration::from_secs(3600))]
    pub timeout: Duration,
    #[builder(default = 3)]
    pub max_retries: u32,
    pub payload: ExportPayload,
}

#[derive(Debug, Default)]
pub struct ManagerMetrics {
    pub jobs_enqueued: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub jobs_timeout: AtomicU64,
    pub active_workers: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_queue_size: usize,
    pub max_workers: usize,
    pub default_timeout: Duration,
    pub shutdown_drain_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_workers: 8,
            default_timeout: Duration::from_secs(3600),
            shutdown_drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared state behind every handle into the manager; workers and the
/// public API both hold an `Arc<ManagerState>`.
pub(super) struct ManagerState {
    pub(super) jobs: Mutex<HashMap<Uuid, Job>>,
    pub(super) queue: Mutex<PriorityQueue>,
    pub(super) running: RwLock<HashMap<Uuid, CancellationToken>>,
    pub(super) notify: Notify,
    pub(super) shutdown: CancellationToken,
    pub(super) registry: Arc<ProviderRegistry>,
    pub(super) listener: Arc<dyn LifecycleListener>,
    pub(super) change_tracker: Arc<ChangeTracker>,
    pub(super) metrics: ManagerMetrics,
    pub(super) config: ManagerConfig,
}

/// Coordinates submission, dispatch, and lifecycle of export jobs. Owns no
/// worker threads itself; `spawn_workers` hands back join handles the
/// caller (typically the kernel) drives.
pub struct JobManager {
    pub(super) state: Arc<ManagerState>,
}

impl JobManager {
    pub fn new(
        config: ManagerConfig,
        registry: Arc<ProviderRegistry>,
        listener: Arc<dyn LifecycleListener>,
        change_tracker: Arc<ChangeTracker>,
    ) -> Self {
        let max_queue_size = config.max_queue_size;
        Self {
            state: Arc::new(ManagerState {
                jobs: Mutex::new(HashMap::new()),
                queue: Mutex::new(PriorityQueue::new(max_queue_size)),
                running: RwLock::new(HashMap::new()),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                registry,
                listener,
                change_tracker,
                metrics: ManagerMetrics::default(),
                config,
            }),
        }
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.state.metrics
    }

    /// Submit a new job. Fails with `QueueFull` at capacity (spec §4.6
    /// invariant 5); otherwise enqueues immediately and returns the
    /// assigned job.
    pub async fn submit(&self, submission: JobSubmission) -> Result<Job> {
        let payload = serde_json::to_value(&submission.payload)
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let job = Job::builder()
            .name(submission.name)
            .priority(submission.priority)
            .timeout(submission.timeout)
            .max_retries(submission.max_retries)
            .payload(payload)
            .build();

        {
            let mut queue = self.state.queue.lock().await;
            queue.enqueue(job.id, job.priority, job.submitted_at)?;
        }
        self.state.jobs.lock().await.insert(job.id, job.clone());
        self.state.metrics.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.state.listener.on_event(JobEvent::created(&job)).await;
        self.state.notify.notify_one();
        info!(job_id = %job.id, name = %job.name, "job submitted");
        Ok(job)
    }

    /// Cancel a job. Idempotent: cancelling an already-terminal job is a
    /// no-op. A pending job is pulled out of the queue and marked
    /// cancelled immediately; a running job's cancellation token is
    /// tripped and the worker observes it cooperatively.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.state.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(CoreError::JobNotFound(job_id))?;
        if job.is_terminal() {
            return Ok(());
        }

        match job.status {
            JobStatus::Pending => {
                self.state.queue.lock().await.remove(job_id);
                job.status = JobStatus::Cancelled;
                job.progress.ended_at = Some(chrono::Utc::now());
                self.state.metrics.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
                let event = JobEvent::cancelled(job);
                drop(jobs);
                self.state.listener.on_event(event).await;
            }
            JobStatus::Running => {
                if let Some(token) = self.state.running.read().await.get(&job_id) {
                    token.cancel();
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job> {
        self.state
            .jobs
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(CoreError::JobNotFound(job_id))
    }

    pub async fn query(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.state
            .jobs
            .lock()
            .await
            .values()
            .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn current_queue_size_hint(&self) -> usize {
        // Best-effort, non-blocking: callers needing an exact figure
        // should use `query` instead.
        self.state.queue.try_lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Signal shutdown, cancel every running job, and wait up to
    /// `shutdown_drain_timeout` for workers to observe it. Idempotent.
    pub async fn shutdown(&self) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        self.state.shutdown.cancel();
        let tokens: Vec<CancellationToken> =
            self.state.running.read().await.values().cloned().collect();
        for token in tokens {
            token.cancel();
        }
        let deadline = self.state.config.shutdown_drain_timeout;
        let waited = tokio::time::timeout(deadline, async {
            loop {
                if self.state.running.read().await.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        if waited.is_err() {
            warn!("shutdown drain timed out with jobs still running");
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    pub(super) fn state(&self) -> Arc<ManagerState> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::events::NullListener;

    fn sample_submission() -> JobSubmission {
        JobSubmission::builder()
            .name("export vm-1")
            .payload(ExportPayload {
                provider_type: "vsphere".to_string(),
                provider_config: ProviderConfig::builder().endpoint("https://vc").build(),
                vm_id: "vm-1".to_string(),
                export_options: Default::default(),
            })
            .build()
    }

    fn manager() -> JobManager {
        JobManager::new(
            ManagerConfig::default(),
            Arc::new(ProviderRegistry::new()),
            Arc::new(NullListener),
            Arc::new(ChangeTracker::new(std::env::temp_dir())),
        )
    }

    #[tokio::test]
    async fn submit_then_get_round_trips() {
        let mgr = manager();
        let job = mgr.submit(sample_submission()).await.unwrap();
        let fetched = mgr.get(job.id).await.unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn submit_respects_queue_capacity() {
        let mgr = JobManager::new(
            ManagerConfig {
                max_queue_size: 1,
                ..Default::default()
            },
            Arc::new(ProviderRegistry::new()),
            Arc::new(NullListener),
            Arc::new(ChangeTracker::new(std::env::temp_dir())),
        );
        mgr.submit(sample_submission()).await.unwrap();
        let err = mgr.submit(sample_submission()).await.unwrap_err();
        assert!(matches!(err, CoreError::QueueFull));
    }

    #[tokio::test]
    async fn cancel_pending_job_is_immediate() {
        let mgr = manager();
        let job = mgr.submit(sample_submission()).await.unwrap();
        mgr.cancel(job.id).await.unwrap();
        let fetched = mgr.get(job.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_job() {
        let mgr = manager();
        let job = mgr.submit(sample_submission()).await.unwrap();
        mgr.cancel(job.id).await.unwrap();
        mgr.cancel(job.id).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let mgr = manager();
        let err = mgr.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let mgr = manager();
        mgr.shutdown().await;
        mgr.shutdown().await;
    }
}
