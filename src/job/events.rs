//! Job lifecycle events and the listener interface the webhook notifier
//! implements.
//!
//! Modeled as a one-way edge (design note in spec §9): the manager holds a
//! `Arc<dyn LifecycleListener>` and calls it on every transition; the
//! notifier never needs a back-reference into the manager.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{Job, JobPriority};
use crate::error::ErrorKind;

/// Lifecycle events a job passes through, in order
/// (`created -> started -> progress* -> terminal`) as observed by a single
/// listener (spec §5 ordering guarantee).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    Created {
        job_id: Uuid,
        name: String,
        priority: JobPriority,
    },
    Started {
        job_id: Uuid,
        attempt: u32,
    },
    Progress {
        job_id: Uuid,
        percent: f32,
        bytes_downloaded: u64,
        bytes_total: u64,
    },
    Completed {
        job_id: Uuid,
        result: Option<String>,
    },
    Failed {
        job_id: Uuid,
        error: String,
        error_kind: ErrorKind,
        attempt: u32,
        will_retry: bool,
    },
    Cancelled {
        job_id: Uuid,
    },
}

impl JobEvent {
    /// The event-name tag used for webhook subscription filtering
    /// (`created`, `started`, `progress`, `completed`, `failed`, `cancelled`).
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Created { .. } => "created",
            JobEvent::Started { .. } => "started",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Cancelled { .. } => "cancelled",
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Created { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id } => *job_id,
        }
    }
}

/// Convenience constructors mirroring each job lifecycle transition.
impl JobEvent {
    pub fn created(job: &Job) -> Self {
        JobEvent::Created {
            job_id: job.id,
            name: job.name.clone(),
            priority: job.priority,
        }
    }

    pub fn started(job: &Job) -> Self {
        JobEvent::Started {
            job_id: job.id,
            attempt: job.attempt,
        }
    }

    pub fn progress(job: &Job) -> Self {
        JobEvent::Progress {
            job_id: job.id,
            percent: job.progress.percent,
            bytes_downloaded: job.progress.bytes_downloaded,
            bytes_total: job.progress.bytes_total,
        }
    }

    pub fn completed(job: &Job) -> Self {
        JobEvent::Completed {
            job_id: job.id,
            result: job.result.clone(),
        }
    }

    pub fn failed(job: &Job, will_retry: bool) -> Self {
        JobEvent::Failed {
            job_id: job.id,
            error: job.error.clone().unwrap_or_default(),
            error_kind: job.error_kind.unwrap_or(ErrorKind::Permanent),
            attempt: job.attempt,
            will_retry,
        }
    }

    pub fn cancelled(job: &Job) -> Self {
        JobEvent::Cancelled { job_id: job.id }
    }
}

/// Interface the job manager consumes to publish lifecycle transitions.
/// Implemented by the webhook notifier; the manager never reaches back
/// into the notifier's internals.
#[async_trait::async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn on_event(&self, event: JobEvent);
}

/// A listener that drops every event; useful as a default in tests and
/// when webhooks are disabled.
pub struct NullListener;

#[async_trait::async_trait]
impl LifecycleListener for NullListener {
    async fn on_event(&self, _event: JobEvent) {}
}
