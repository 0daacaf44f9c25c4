//! Redis backend for strata
//!
//! Plugs a pooled, TTL-native redis store into a
//! [`strata_core::Registry`] under the `"redis"` backend name. Objects
//! cross the wire as JSON text; namespaced maps ride on engine-side
//! hashes with a single namespace TTL.

pub mod config;
mod pool;
pub mod store;

use std::sync::Arc;

use strata_core::{Registry, Result, SharedStore};

pub use config::RedisConfig;
pub use store::RedisStore;

/// Register the `"redis"` backend on a registry.
pub fn register_redis(registry: &mut Registry) -> Result<()> {
    registry.register(
        "redis",
        Box::new(|config: String| {
            Box::pin(async move {
                let config = RedisConfig::from_json(&config)?;
                Ok(Arc::new(RedisStore::connect(config).await?) as SharedStore)
            })
        }),
    )
}
