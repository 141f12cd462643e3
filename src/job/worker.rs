//! The worker pool loop: dequeue, dispatch to a provider, apply the
//! retry/timeout/cancel/terminal state transitions.
//!
//! Grounded on the teacher's `JobWorker` (`kernel/jobs/worker.rs`): the
//! heartbeat-via-spawned-task-plus-`tokio::select!` shape is reused here
//! for the progress pump, and the per-job `CancellationToken` stored in a
//! shared map is the same cooperative-shutdown idiom.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::change_tracker::ExportMetadata;
use crate::error::ErrorKind;
use crate::provider::{ProgressSink, ProgressUpdate, ProviderError};

use super::events::JobEvent;
use super::manager::{ExportPayload, JobManager, ManagerState};
use super::model::{Job, JobStatus};

const PROGRESS_COALESCE: Duration = Duration::from_millis(100);

enum Outcome {
    Finished(Result<crate::provider::ExportResult, ProviderError>),
    TimedOut,
    CancelledBackstop,
}

/// Spawn `count` worker tasks pulling from `manager`'s queue. Returns the
/// join handles; the caller (typically the kernel) awaits them at
/// shutdown.
pub fn spawn_workers(manager: &JobManager, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let state = manager.state();
            tokio::spawn(run_worker(state, worker_id))
        })
        .collect()
}

async fn run_worker(state: Arc<ManagerState>, worker_id: usize) {
    info!(worker_id, "worker started");
    loop {
        if state.shutdown.is_cancelled() {
            break;
        }
        let next = state.queue.lock().await.dequeue().ok();
        match next {
            Some(job_id) => process_job(&state, job_id).await,
            None => {
                tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    _ = state.notify.notified() => {}
                }
            }
        }
    }
    info!(worker_id, "worker stopped");
}

async fn process_job(state: &Arc<ManagerState>, job_id: Uuid) {
    let mut job = {
        let mut jobs = state.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                if job.progress.started_at.is_none() {
                    job.progress.started_at = Some(Utc::now());
                }
                job.clone()
            }
            // Cancelled out from under us between dequeue and here, or
            // already gone; nothing to do.
            _ => return,
        }
    };

    let job_cancel = state.shutdown.child_token();
    state.running.write().await.insert(job_id, job_cancel.clone());
    state
        .metrics
        .active_workers
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    state.listener.on_event(JobEvent::started(&job)).await;

    let outcome = run_once(state, &job, job_cancel.clone()).await;
    let was_cancelled = job_cancel.is_cancelled();

    state.running.write().await.remove(&job_id);
    state
        .metrics
        .active_workers
        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);

    apply_outcome(state, &mut job, outcome, was_cancelled).await;
}

async fn run_once(state: &Arc<ManagerState>, job: &Job, job_cancel: CancellationToken) -> Outcome {
    let payload: ExportPayload = match serde_json::from_value(job.payload.clone()) {
        Ok(p) => p,
        Err(e) => {
            return Outcome::Finished(Err(ProviderError::permanent(format!(
                "malformed job payload: {e}"
            ))))
        }
    };

    let adapter = match state
        .registry
        .get(&payload.provider_type, payload.provider_config.clone())
        .await
    {
        Ok(adapter) => adapter,
        Err(e) => return Outcome::Finished(Err(ProviderError::permanent(e.to_string()))),
    };

    if let Err(e) = adapter.connect(&payload.provider_config).await {
        return Outcome::Finished(Err(ProviderError::transient(e.to_string())));
    }

    let (tx, rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let sink: ProgressSink = Arc::new(move |update| {
        let _ = tx.send(update);
    });
    let pump = tokio::spawn(pump_progress(state.clone(), job.id, rx));

    let deadline = std::cmp::min(job.timeout, state.config.default_timeout);
    let export_fut = adapter.export_vm(
        &payload.vm_id,
        &payload.export_options,
        sink,
        job_cancel.clone(),
    );
    tokio::pin!(export_fut);

    let outcome = tokio::select! {
        biased;
        res = &mut export_fut => Outcome::Finished(res),
        _ = job_cancel.cancelled() => Outcome::CancelledBackstop,
        _ = tokio::time::sleep(deadline) => Outcome::TimedOut,
    };
    drop(export_fut);
    let _ = pump.await;

    if let Err(e) = adapter.disconnect().await {
        warn!(job_id = %job.id, error = %e, "disconnect failed");
    }

    outcome
}

async fn pump_progress(state: Arc<ManagerState>, job_id: Uuid, mut rx: mpsc::UnboundedReceiver<ProgressUpdate>) {
    let mut last_emit: Option<Instant> = None;
    while let Some(update) = rx.recv().await {
        let emit = last_emit.map(|t| t.elapsed() >= PROGRESS_COALESCE).unwrap_or(true);
        let mut jobs = state.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else { continue };
        job.progress.apply(
            &update.phase,
            update.percent,
            update.bytes_downloaded,
            update.bytes_total,
            update.files_downloaded,
            update.files_total,
        );
        if emit {
            let event = JobEvent::progress(job);
            drop(jobs);
            state.listener.on_event(event).await;
            last_emit = Some(Instant::now());
        }
    }
}

async fn apply_outcome(state: &Arc<ManagerState>, job: &mut Job, outcome: Outcome, cancel_requested: bool) {
    use std::sync::atomic::Ordering;

    match outcome {
        Outcome::CancelledBackstop => {
            job.status = JobStatus::Cancelled;
            job.progress.ended_at = Some(Utc::now());
            state.metrics.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
            state.jobs.lock().await.insert(job.id, job.clone());
            state.listener.on_event(JobEvent::cancelled(job)).await;
        }
        Outcome::TimedOut => {
            // Deadline elapsed while the adapter kept running. Timeouts
            // are retried like transient failures, but counted
            // separately (spec §4.6 invariant 4).
            state.metrics.jobs_timeout.fetch_add(1, Ordering::Relaxed);
            finish_failure(state, job, "export deadline exceeded", ErrorKind::Timeout).await;
        }
        Outcome::Finished(Ok(result)) => {
            job.status = JobStatus::Completed;
            job.progress.ended_at = Some(Utc::now());
            job.progress.percent = 100.0;
            state.metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);

            let disk_change_ids = result
                .disk_changes
                .iter()
                .map(|c| (c.disk_key.clone(), c.change_id.clone()))
                .collect();
            if let Ok(payload) = serde_json::from_value::<ExportPayload>(job.payload.clone()) {
                let metadata = ExportMetadata::new(payload.vm_id, disk_change_ids);
                if let Err(e) = state.change_tracker.record_export(&metadata).await {
                    warn!(job_id = %job.id, error = %e, "failed to record export for incremental tracking");
                }
            }

            job.result = Some(result.output_path);
            state.jobs.lock().await.insert(job.id, job.clone());
            state.listener.on_event(JobEvent::completed(job)).await;
        }
        Outcome::Finished(Err(provider_err))
            if cancel_requested || provider_err.kind == ErrorKind::Cancelled =>
        {
            job.status = JobStatus::Cancelled;
            job.progress.ended_at = Some(Utc::now());
            state.metrics.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
            state.jobs.lock().await.insert(job.id, job.clone());
            state.listener.on_event(JobEvent::cancelled(job)).await;
        }
        Outcome::Finished(Err(provider_err)) => {
            finish_failure(state, job, &provider_err.message, provider_err.kind).await;
        }
    }
}

async fn finish_failure(state: &Arc<ManagerState>, job: &mut Job, message: &str, kind: ErrorKind) {
    use std::sync::atomic::Ordering;

    job.error = Some(message.to_string());
    job.error_kind = Some(kind);

    let will_retry = kind.is_retryable() && job.attempt + 1 < job.max_retries;
    if will_retry {
        job.prepare_retry();
        state.metrics.jobs_retried.fetch_add(1, Ordering::Relaxed);
        state.jobs.lock().await.insert(job.id, job.clone());
        let event = JobEvent::failed(job, true);
        state.listener.on_event(event).await;

        // Re-enqueue preserving the original submission time so retries
        // don't perpetually jump the priority band's FIFO order.
        if let Err(e) = state
            .queue
            .lock()
            .await
            .enqueue(job.id, job.priority, job.submitted_at)
        {
            error!(job_id = %job.id, error = %e, "failed to re-enqueue retry; dropping job as failed");
            let mut jobs = state.jobs.lock().await;
            if let Some(stored) = jobs.get_mut(&job.id) {
                stored.status = JobStatus::Failed;
            }
        } else {
            state.notify.notify_one();
        }
    } else {
        job.status = JobStatus::Failed;
        job.progress.ended_at = Some(Utc::now());
        state.metrics.jobs_failed.fetch_add(1, Ordering::Relaxed);
        state.jobs.lock().await.insert(job.id, job.clone());
        let event = JobEvent::failed(job, false);
        state.listener.on_event(event).await;
    }
}
