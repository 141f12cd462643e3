use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of one completed export, enough to decide whether the next
/// export of the same VM can be incremental (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub vm_id: String,
    pub exported_at: DateTime<Utc>,
    /// Disk key -> provider-assigned change id at the time of this export.
    /// A disk with an empty change id means the provider couldn't supply
    /// one for that disk (conservatively disqualifies future incrementals
    /// against this snapshot).
    pub disk_change_ids: BTreeMap<String, String>,
}

impl ExportMetadata {
    pub fn new(vm_id: impl Into<String>, disk_change_ids: BTreeMap<String, String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            exported_at: Utc::now(),
            disk_change_ids,
        }
    }
}
