//! Cloud provider backends.
//!
//! Each backend implements [`CloudProvider`]; the [`ProviderRegistry`] is the
//! dispatch table that picks one by its [`ProviderKind`] tag. Backends only
//! ever see machines they tagged as managed when creating them.

mod hetzner;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{FleetConfig, ProviderConfig, ProvisionDefaults};
use crate::machine::{InstanceSpec, Machine, ProviderKind};

pub use hetzner::{HetznerProvider, HETZNER_API_URL, INSTANCE_TYPES, SUPPORTED_REGIONS};
pub use memory::{InMemoryProvider, ProviderCall};

/// Label every managed machine carries.
pub const MANAGED_LABEL: &str = "cloudAgent";

/// Label carrying the desired-state name.
pub const NAME_LABEL: &str = "cloudAgentName";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API returned {status}: {body}")]
    Api {
        provider: ProviderKind,
        status: u16,
        body: String,
    },

    #[error("{provider} request failed: {source}")]
    Transport {
        provider: ProviderKind,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} does not support {what} '{value}'")]
    Unsupported {
        provider: ProviderKind,
        what: &'static str,
        value: String,
    },

    #[error("{provider} returned an unexpected response: {message}")]
    Malformed {
        provider: ProviderKind,
        message: String,
    },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Capability interface implemented by every provider backend.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Every machine this system created, in provider order.
    async fn list_managed(&self) -> ProviderResult<Vec<Machine>>;

    async fn create(&self, spec: &InstanceSpec) -> ProviderResult<Machine>;

    /// Deletes a machine. Deleting a machine that is already gone succeeds.
    async fn destroy(&self, machine_id: &str) -> ProviderResult<()>;

    async fn start(&self, machine_id: &str) -> ProviderResult<()>;

    async fn stop(&self, machine_id: &str) -> ProviderResult<()>;
}

/// Provider backends keyed by tag.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderKind, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one backend per configured provider.
    pub fn from_config(config: &FleetConfig, defaults: ProvisionDefaults) -> ProviderResult<Self> {
        let mut registry = Self::new();
        for provider in &config.vm.providers {
            let backend: Arc<dyn CloudProvider> = match provider {
                ProviderConfig::Hetzner(cfg) => {
                    Arc::new(HetznerProvider::new(&cfg.token, defaults.clone())?)
                }
            };
            registry.insert(backend);
        }
        Ok(registry)
    }

    pub fn with(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.insert(provider);
        self
    }

    pub fn insert(&mut self, provider: Arc<dyn CloudProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn CloudProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Configured backends in tag order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CloudProvider>> {
        self.providers.values()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}
