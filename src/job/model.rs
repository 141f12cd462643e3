//! Job model: the unit of work tracked by the manager.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Total order over job priorities: critical > high > normal > low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Rank used for queue ordering; higher sorts first.
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Critical => 3,
        }
    }
}

/// Job lifecycle state. `Completed`, `Failed`, and `Cancelled` are
/// terminal and absorbing: once reached, no further state transition is
/// permitted (only `result`/`error` fields may still be populated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Progress record embedded in a job, updated by the provider's
/// `ProgressSink` callback as the export runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Progress {
    pub phase: String,
    pub percent: f32,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub files_downloaded: u64,
    pub files_total: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Progress {
    /// Apply an update from a provider, refusing to let `bytes_downloaded`
    /// regress as observed externally (spec §5 ordering guarantee).
    pub fn apply(
        &mut self,
        phase: &str,
        percent: f32,
        bytes_downloaded: u64,
        bytes_total: u64,
        files_downloaded: u64,
        files_total: u64,
    ) {
        self.phase = phase.to_string();
        self.percent = percent;
        self.bytes_downloaded = self.bytes_downloaded.max(bytes_downloaded);
        self.bytes_total = bytes_total;
        self.files_downloaded = self.files_downloaded.max(files_downloaded);
        self.files_total = files_total;
    }
}

/// A unit of export work submitted to the manager.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub name: String,

    #[builder(default)]
    pub priority: JobPriority,

    #[builder(default = Utc::now())]
    pub submitted_at: DateTime<Utc>,

    #[builder(default = Duration::from_secs(3600))]
    pub timeout: Duration,

    #[builder(default = 3)]
    pub max_retries: u32,

    #[builder(default = 0)]
    pub attempt: u32,

    /// Opaque, provider-specific payload (e.g. VM id + export options).
    pub payload: serde_json::Value,

    #[builder(default)]
    pub progress: Progress,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default, setter(strip_option))]
    pub result: Option<String>,

    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,
}

impl Job {
    /// Whether this job has reached a terminal, absorbing state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Build a retry of this job: same id and submission time (so repeated
    /// failures don't perpetually favour retried jobs over the rest of the
    /// priority band, per spec §4.6), incremented attempt, cleared error.
    pub fn prepare_retry(&mut self) {
        self.attempt += 1;
        self.status = JobStatus::Pending;
        self.error = None;
        self.error_kind = None;
    }
}
