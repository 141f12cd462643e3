pub mod connection;

pub use connection::{ConnectionPool, PoolGuard, SessionFactory};
