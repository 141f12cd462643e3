pub mod events;
pub mod manager;
pub mod model;
pub mod queue;
pub mod worker;

pub use events::{JobEvent, LifecycleListener, NullListener};
pub use manager::{ExportPayload, JobManager, JobSubmission, ManagerConfig, ManagerMetrics};
pub use model::{Job, JobPriority, JobStatus, Progress};
pub use queue::PriorityQueue;
pub use worker::spawn_workers;
