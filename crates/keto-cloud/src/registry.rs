use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use keto_core::{Error, NodeId, Result};

use crate::file::FileTagStore;
use crate::provider::TagStore;

/// Default path of the file provider's tag document.
pub const DEFAULT_TAGS_FILE: &str = "keto-tags.json";

/// Settings passed to a provider factory.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    /// Tag document for the `file` provider.
    pub tags_file: Option<PathBuf>,
    /// Local node id, for providers that cannot discover it.
    pub node_id: Option<NodeId>,
}

/// Builds a tag store from provider options.
pub type ProviderFactory = fn(&ProviderOptions) -> Result<Arc<dyn TagStore>>;

/// Explicit name-to-factory table of tag store providers.
///
/// Providers are registered by whoever builds the registry; nothing registers
/// itself at load time.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `file` provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file", file_provider);
        registry
    }

    /// Add or replace a provider.
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str, options: &ProviderOptions) -> Result<Arc<dyn TagStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::ProviderNotRegistered(name.to_string()))?;
        factory(options)
    }
}

fn file_provider(options: &ProviderOptions) -> Result<Arc<dyn TagStore>> {
    let path = options
        .tags_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TAGS_FILE));
    Ok(Arc::new(FileTagStore::new(path, options.node_id.clone())))
}
