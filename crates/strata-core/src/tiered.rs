//! Two-tier store composition with read-through, write-through and backfill

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::store::{Expiry, Store, StoreMap};

/// Composes two stores into one.
///
/// `tier1` is the near, disposable accelerator checked first; `tier2` is
/// the source of truth on divergence. Writes go through both tiers, reads
/// fall through and backfill tier1, and a tier2 hole is healed on the
/// next read while a tier1-only entry is never pushed back toward tier2.
pub struct TieredStore {
    tier1: Arc<dyn Store>,
    tier2: Arc<dyn Store>,
}

impl TieredStore {
    pub fn new(tier1: Arc<dyn Store>, tier2: Arc<dyn Store>) -> Self {
        Self { tier1, tier2 }
    }

    async fn backfill(&self, key: &str, val: &str) {
        // Tier1 applies its own default expire; a failed backfill only
        // costs performance, not correctness.
        if let Err(e) = self.tier1.put(key, val, &Expiry::none()).await {
            warn!(key, error = %e, "backfill into tier1 failed");
        }
    }

    async fn backfill_object(&self, key: &str, val: serde_json::Value) {
        if let Err(e) = self.tier1.put_object(key, val, &Expiry::none()).await {
            warn!(key, error = %e, "object backfill into tier1 failed");
        }
    }
}

/// Right-fold a chain of stores into a single tiered store: the two
/// innermost (slowest) stores compose first, and the result becomes the
/// far tier of the next store out. A single store is returned unchanged.
pub fn compose(mut stores: Vec<Arc<dyn Store>>) -> Result<Arc<dyn Store>> {
    if stores.is_empty() {
        return Err(CacheError::Config(
            "compose requires at least one store".into(),
        ));
    }
    while stores.len() > 1 {
        if let (Some(far), Some(near)) = (stores.pop(), stores.pop()) {
            stores.push(Arc::new(TieredStore::new(near, far)));
        }
    }
    stores
        .pop()
        .ok_or_else(|| CacheError::Config("compose requires at least one store".into()))
}

#[async_trait]
impl Store for TieredStore {
    async fn put(&self, key: &str, val: &str, expire: &Expiry) -> Result<()> {
        let r1 = self.tier1.put(key, val, &expire.head_expiry()).await;
        let r2 = self.tier2.put(key, val, &expire.tail()).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn get(&self, key: &str) -> Result<String> {
        match self.tier1.get(key).await {
            Ok(val) => Ok(val),
            Err(e1) => {
                debug!(key, error = %e1, "tier1 miss, falling through");
                let val = self.tier2.get(key).await?;
                self.backfill(key, &val).await;
                Ok(val)
            }
        }
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if let Ok(values) = self.tier1.get_multi(keys).await
            && values.iter().any(|v| !v.is_empty())
        {
            return Ok(values);
        }
        let values = self.tier2.get_multi(keys).await?;
        for (key, val) in keys.iter().zip(&values) {
            self.backfill(key, val).await;
        }
        Ok(values)
    }

    async fn put_object(&self, key: &str, val: serde_json::Value, expire: &Expiry) -> Result<()> {
        let r1 = self
            .tier1
            .put_object(key, val.clone(), &expire.head_expiry())
            .await;
        let r2 = self.tier2.put_object(key, val, &expire.tail()).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn get_object(&self, key: &str) -> Result<serde_json::Value> {
        match self.tier1.get_object(key).await {
            Ok(val) => Ok(val),
            Err(e1) => {
                debug!(key, error = %e1, "tier1 object miss, falling through");
                let val = self.tier2.get_object(key).await?;
                self.backfill_object(key, val.clone()).await;
                Ok(val)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let r1 = self.tier1.delete(key).await;
        let r2 = self.tier2.delete(key).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn incr(&self, key: &str) -> Result<()> {
        let r1 = self.tier1.incr(key).await;
        let r2 = self.tier2.incr(key).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn decr(&self, key: &str) -> Result<()> {
        let r1 = self.tier1.decr(key).await;
        let r2 = self.tier2.decr(key).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn exists(&self, key: &str) -> bool {
        if self.tier1.exists(key).await {
            return true;
        }
        self.tier2.exists(key).await
    }

    async fn set_expire(&self, key: &str, expire: &Expiry) -> Result<()> {
        if expire.is_none() {
            return Ok(());
        }
        let r1 = self.tier1.set_expire(key, &expire.head_expiry()).await;
        let tail = expire.tail();
        let r2 = if tail.is_none() {
            Ok(())
        } else {
            self.tier2.set_expire(key, &tail).await
        };
        CacheError::merge(r1.err(), r2.err())
    }

    async fn new_map(&self, name: &str, expire: &Expiry) -> Result<Box<dyn StoreMap>> {
        let m1 = self.tier1.new_map(name, &expire.head_expiry()).await;
        let m2 = self.tier2.new_map(name, &expire.tail()).await;
        match (m1, m2) {
            (Ok(map1), Ok(map2)) => Ok(Box::new(TieredMap { map1, map2 })),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Err(e1), Err(e2)) => Err(CacheError::Composite(format!("{e1}, {e2}"))),
        }
    }
}

/// Composed namespace applying the same read-through/write-through/
/// backfill/error-merge rules per map operation.
struct TieredMap {
    map1: Box<dyn StoreMap>,
    map2: Box<dyn StoreMap>,
}

impl TieredMap {
    async fn backfill(&self, key: &str, val: &str) {
        if let Err(e) = self.map1.put(key, val).await {
            warn!(key, error = %e, "map backfill into tier1 failed");
        }
    }
}

#[async_trait]
impl StoreMap for TieredMap {
    async fn put(&self, key: &str, val: &str) -> Result<()> {
        let r1 = self.map1.put(key, val).await;
        let r2 = self.map2.put(key, val).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn get(&self, key: &str) -> Result<String> {
        match self.map1.get(key).await {
            Ok(val) => Ok(val),
            Err(_) => {
                let val = self.map2.get(key).await?;
                self.backfill(key, &val).await;
                Ok(val)
            }
        }
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if let Ok(values) = self.map1.get_multi(keys).await
            && values.iter().any(|v| !v.is_empty())
        {
            return Ok(values);
        }
        let values = self.map2.get_multi(keys).await?;
        for (key, val) in keys.iter().zip(&values) {
            self.backfill(key, val).await;
        }
        Ok(values)
    }

    async fn put_object(&self, key: &str, val: serde_json::Value) -> Result<()> {
        let r1 = self.map1.put_object(key, val.clone()).await;
        let r2 = self.map2.put_object(key, val).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn get_object(&self, key: &str) -> Result<serde_json::Value> {
        match self.map1.get_object(key).await {
            Ok(val) => Ok(val),
            Err(_) => {
                let val = self.map2.get_object(key).await?;
                if let Err(e) = self.map1.put_object(key, val.clone()).await {
                    warn!(key, error = %e, "map object backfill into tier1 failed");
                }
                Ok(val)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let r1 = self.map1.delete(key).await;
        let r2 = self.map2.delete(key).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn incr(&self, key: &str) -> Result<()> {
        let r1 = self.map1.incr(key).await;
        let r2 = self.map2.incr(key).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn decr(&self, key: &str) -> Result<()> {
        let r1 = self.map1.decr(key).await;
        let r2 = self.map2.decr(key).await;
        CacheError::merge(r1.err(), r2.err())
    }

    async fn exists(&self, key: &str) -> bool {
        if self.map1.exists(key).await {
            return true;
        }
        self.map2.exists(key).await
    }

    async fn len(&self) -> Result<usize> {
        match self.map1.len().await {
            Ok(n) => Ok(n),
            Err(_) => self.map2.len().await,
        }
    }

    async fn clear(&self) -> Result<()> {
        let r1 = self.map1.clear().await;
        let r2 = self.map2.clear().await;
        CacheError::merge(r1.err(), r2.err())
    }
}
