pub mod adapter;
pub mod capability;
pub mod registry;

pub use adapter::{
    DiskChange, DiskInfo, ExportCapabilities, ExportOptions, ExportResult, ProgressSink,
    ProgressUpdate, ProviderAdapter, ProviderConfig, ProviderError, VMFilter, VMInfo,
};
pub use capability::{CapabilityDetector, CapabilityRecord, ExportMethod};
pub use registry::ProviderRegistry;
