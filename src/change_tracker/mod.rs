pub mod model;
pub mod tracker;

pub use model::ExportMetadata;
pub use tracker::ChangeTracker;
