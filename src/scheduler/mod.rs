pub mod model;
pub mod service;

pub use model::{Schedule, Trigger};
pub use service::Scheduler;
