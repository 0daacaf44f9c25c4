//! Store and map traits

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Per-tier expiry options.
///
/// Replaces positional variable-length expire arguments with an explicit
/// options value: the head duration applies to the store a call lands on,
/// and the tail is forwarded to deeper tiers by the composer. An empty
/// `Expiry` means "use the store's default"; a `Duration::ZERO` entry
/// means "never expires" even when a default is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expiry {
    tiers: Vec<Duration>,
}

impl Expiry {
    /// No per-call expiry; each store falls back to its configured default.
    pub fn none() -> Self {
        Self::default()
    }

    /// Expire after `d` on the store the call lands on.
    pub fn after(d: Duration) -> Self {
        Self { tiers: vec![d] }
    }

    /// One duration per tier, outermost (nearest) first.
    pub fn per_tier<I: IntoIterator<Item = Duration>>(durations: I) -> Self {
        Self {
            tiers: durations.into_iter().collect(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Duration addressed to the current tier, if any.
    pub fn head(&self) -> Option<Duration> {
        self.tiers.first().copied()
    }

    /// The head as a standalone single-tier expiry.
    pub fn head_expiry(&self) -> Expiry {
        match self.head() {
            Some(d) => Expiry::after(d),
            None => Expiry::none(),
        }
    }

    /// Durations addressed to the deeper tiers.
    pub fn tail(&self) -> Expiry {
        Self {
            tiers: self.tiers.get(1..).unwrap_or_default().to_vec(),
        }
    }
}

/// Uniform contract over every cache backend.
///
/// Implementations manage their own entries and expiry independently;
/// composition over two stores is itself a `Store`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Store a string value under `key`.
    async fn put(&self, key: &str, val: &str, expire: &Expiry) -> Result<()>;

    /// Fetch a value, rendering scalars to a string. Absent or expired
    /// keys fail with `NotFound`.
    async fn get(&self, key: &str) -> Result<String>;

    /// Batch fetch. The result is positionally aligned with `keys` and
    /// always has the same length, with an empty string for absent keys.
    async fn get_multi(&self, keys: &[&str]) -> Result<Vec<String>>;

    /// Store an object value under `key`.
    async fn put_object(&self, key: &str, val: serde_json::Value, expire: &Expiry) -> Result<()>;

    /// Fetch an object value, type-preserving.
    async fn get_object(&self, key: &str) -> Result<serde_json::Value>;

    /// Remove a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Increment an integer-family value by one, initializing an absent
    /// key to an unsigned zero first.
    async fn incr(&self, key: &str) -> Result<()>;

    /// Decrement an integer-family value by one, initializing an absent
    /// key to an unsigned zero first. An unsigned value at zero fails
    /// with a `Range` error rather than wrapping.
    async fn decr(&self, key: &str) -> Result<()>;

    /// Whether `key` is present and live. Transport failures read as
    /// false and are logged by the backend.
    async fn exists(&self, key: &str) -> bool;

    /// Reset a key's expiry window. An empty expiry is a no-op.
    async fn set_expire(&self, key: &str, expire: &Expiry) -> Result<()>;

    /// Create or reset the namespace `name` and return a handle to it.
    async fn new_map(&self, name: &str, expire: &Expiry) -> Result<Box<dyn StoreMap>>;
}

impl std::fmt::Debug for dyn Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Store")
    }
}

/// A named sub-collection of key-value pairs sharing one parent expiry.
///
/// Fields have no expiry of their own: the whole namespace lives or dies
/// with its single backing entry. Once that entry expires, reads fail
/// with `NotFound` and writes with `NamespaceExpired`; the handle never
/// resurrects it.
#[async_trait]
pub trait StoreMap: Send + Sync {
    async fn put(&self, key: &str, val: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<String>;
    async fn get_multi(&self, keys: &[&str]) -> Result<Vec<String>>;
    async fn put_object(&self, key: &str, val: serde_json::Value) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<serde_json::Value>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<()>;
    async fn decr(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> bool;
    /// Number of fields in the namespace.
    async fn len(&self) -> Result<usize>;
    /// Drop every field, keeping the namespace itself alive.
    async fn clear(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn StoreMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn StoreMap")
    }
}

/// Serde conveniences over [`Store::put_object`] / [`Store::get_object`].
#[async_trait]
pub trait StoreExt: Store {
    async fn put_json<T>(&self, key: &str, val: &T, expire: &Expiry) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let val = serde_json::to_value(val)?;
        self.put_object(key, val, expire).await
    }

    async fn get_json<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let val = self.get_object(key).await?;
        Ok(serde_json::from_value(val)?)
    }
}

#[async_trait]
impl<S: Store + ?Sized> StoreExt for S {}
