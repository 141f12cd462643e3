//! HyperSDK execution core: job scheduling, provider dispatch, connection
//! pooling, webhook delivery, and incremental-export change tracking for
//! a multi-cloud VM export and backup service.
//!
//! This crate is the execution engine; it does not implement any
//! provider's wire protocol (vSphere SOAP, EC2 API, Azure ARM, ...) or
//! expose a network-facing API of its own. Concrete provider adapters
//! register with a [`provider::ProviderRegistry`] and the [`kernel::HyperKernel`]
//! wires everything else together.

pub mod change_tracker;
pub mod config;
pub mod error;
pub mod job;
pub mod kernel;
pub mod pool;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod webhook;

pub use config::Config;
pub use error::{CoreError, ErrorKind, Result};
pub use kernel::HyperKernel;

/// Initialize the global tracing subscriber from `config.log_level`,
/// falling back to it only when `RUST_LOG` isn't set. Mirrors the
/// teacher's `tracing_subscriber::registry()` setup in its server binary.
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();
}
