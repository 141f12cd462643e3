//! Registry mapping a provider type string to the factory that builds an
//! adapter instance for it. Grounded on the teacher's job registry
//! (`kernel/jobs/registry.rs`), which maps a command name to a boxed async
//! handler the same way.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{CoreError, Result};

use super::adapter::{ProviderAdapter, ProviderConfig};

type Factory = Arc<dyn Fn(ProviderConfig) -> anyhow::Result<Arc<dyn ProviderAdapter>> + Send + Sync>;

/// Maps a provider type (`"vsphere"`, `"ec2"`, `"azure-vm"`, ...) to the
/// factory that constructs a connected-but-not-yet-dialled adapter.
/// Registration is hot-swappable: a later `register` for the same type
/// replaces the earlier one (spec §6).
#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, Factory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register<F>(&self, provider_type: impl Into<String>, factory: F)
    where
        F: Fn(ProviderConfig) -> anyhow::Result<Arc<dyn ProviderAdapter>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .await
            .insert(provider_type.into(), Arc::new(factory));
    }

    pub async fn get(
        &self,
        provider_type: &str,
        config: ProviderConfig,
    ) -> Result<Arc<dyn ProviderAdapter>> {
        let factories = self.factories.read().await;
        let factory = factories
            .get(provider_type)
            .ok_or_else(|| CoreError::UnknownProvider(provider_type.to_string()))?
            .clone();
        drop(factories);
        factory(config).map_err(CoreError::Store)
    }

    pub async fn provider_types(&self) -> Vec<String> {
        self.factories.read().await.keys().cloned().collect()
    }
}
