pub mod durable_store;
pub mod sqlite_store;

pub use durable_store::DurableStore;
pub use sqlite_store::SqliteStore;
