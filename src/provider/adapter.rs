//! The provider adapter interface the core consumes (spec §6).
//!
//! Concrete adapters (vSphere, Hyper-V, AWS, Azure, OCI, Alibaba, ...) live
//! outside this crate; this module only specifies the trait and the value
//! types that cross the boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::error::ErrorKind;

/// Opaque credentials + endpoint + free-form metadata consumed by the
/// factory registered for a provider type. Per design note in spec §9,
/// each adapter is expected to validate the closed set of metadata keys
/// it understands and reject unknown ones rather than silently ignore them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ProviderConfig {
    pub endpoint: String,
    #[builder(default)]
    pub credentials: HashMap<String, String>,
    #[builder(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VMFilter {
    pub name_contains: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VMInfo {
    pub id: String,
    pub name: String,
    pub power_state: String,
    pub disks: Vec<DiskInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub key: String,
    pub size_bytes: u64,
    pub change_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportOptions {
    pub output_path: String,
    pub chunk_size: Option<usize>,
    pub incremental: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub output_path: String,
    pub total_size: u64,
    pub disk_changes: Vec<DiskChange>,
}

/// Per-disk changed-block summary. The open question in spec §9 leaves the
/// bit-level implementation to the adapter; a no-op adapter returning an
/// empty `changed_blocks` vector is permitted and conservatively makes
/// `IsIncrementalPossible` return false downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskChange {
    pub disk_key: String,
    pub change_id: String,
    pub changed_blocks: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportCapabilities {
    pub supports_incremental: bool,
    pub supports_compression: bool,
    pub max_concurrent_exports: Option<u32>,
}

/// Error surfaced by a provider call. Carries the `ErrorKind` discriminator
/// so the worker loop can decide retry eligibility without string sniffing.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "export cancelled".to_string(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }
}

/// Progress callback a provider invokes during `export_vm`. The manager's
/// sink coalesces updates to at most once per 100ms per job before
/// acquiring the job table lock (spec §4.6).
pub type ProgressSink = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub phase: String,
    pub percent: f32,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub files_downloaded: u64,
    pub files_total: u64,
}

/// Capability set every registered provider adapter implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn provider_type(&self) -> &str;

    async fn connect(&self, config: &ProviderConfig) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    async fn validate_credentials(&self) -> anyhow::Result<()>;

    async fn list_vms(&self, filter: &VMFilter) -> anyhow::Result<Vec<VMInfo>>;
    async fn get_vm(&self, id: &str) -> anyhow::Result<VMInfo>;
    async fn search_vms(&self, query: &str) -> anyhow::Result<Vec<VMInfo>>;

    /// `cancel` is tripped when the job is cancelled or the manager shuts
    /// down; well-behaved adapters should observe it and return
    /// `ProviderError::cancelled()` promptly. The worker loop also
    /// enforces the job's deadline independently as a backstop against
    /// adapters that don't.
    async fn export_vm(
        &self,
        id: &str,
        opts: &ExportOptions,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ExportResult, ProviderError>;

    fn export_capabilities(&self) -> ExportCapabilities;
}
