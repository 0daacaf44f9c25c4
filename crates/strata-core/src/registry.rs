//! Backend registry
//!
//! Maps backend names to async constructors. A registry is an explicit
//! instance built once at process configuration time; registration
//! failures are construction-time errors, not aborts.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::memory::{MemoryConfig, MemoryStore};
use crate::store::Store;

/// A resolved store instance.
pub type SharedStore = Arc<dyn Store>;

/// Constructor for a backend: takes the flat JSON option set and yields a
/// live store. Unknown config keys are ignored; a bad required option
/// fails with a `Config` error and no usable store.
pub type StoreFactory = Box<dyn Fn(String) -> BoxFuture<'static, Result<SharedStore>> + Send + Sync>;

pub struct Registry {
    factories: HashMap<String, StoreFactory>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the in-process `"memory"` backend pre-registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .factories
            .insert("memory".to_string(), memory_factory());
        registry
    }

    /// Register a backend. Init-phase only; an empty name or a duplicate
    /// registration is a `Config` error.
    pub fn register(&mut self, name: &str, factory: StoreFactory) -> Result<()> {
        if name.is_empty() {
            return Err(CacheError::Config("backend name is empty".into()));
        }
        if self.factories.contains_key(name) {
            return Err(CacheError::Config(format!(
                "backend {name:?} is already registered"
            )));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Construct the named backend from a flat JSON option set.
    pub async fn resolve(&self, name: &str, config: &str) -> Result<SharedStore> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CacheError::Config(format!("unknown backend {name:?}")))?;
        debug!(backend = name, "resolving store");
        factory(config.to_string()).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn memory_factory() -> StoreFactory {
    Box::new(|config: String| {
        Box::pin(async move {
            let config = if config.trim().is_empty() {
                MemoryConfig::default()
            } else {
                serde_json::from_str(&config)
                    .map_err(|e| CacheError::Config(format!("memory config: {e}")))?
            };
            Ok(Arc::new(MemoryStore::new(config)) as SharedStore)
        })
    })
}
