//! In-process store with per-entry expiry and a background reaper

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{CacheError, Result};
use crate::store::{Expiry, Store, StoreMap};
use crate::value::Value;

/// Expired entries removed per reaper cycle. Bounds the exclusive lock
/// hold time of one sweep; anything beyond the batch waits for the next
/// cycle and stays invisible to readers meanwhile.
const GC_BATCH: usize = 256;

/// Memory store options, deserialized from the registry's flat option set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Reaper period in seconds. Zero disables the background sweep;
    /// expired entries are then only dropped lazily on access.
    pub gc_interval_secs: u64,
    /// Default entry lifetime in seconds. Zero means entries never
    /// expire unless a per-call expire is given.
    pub default_expire_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: 60,
            default_expire_secs: 0,
        }
    }
}

enum Payload {
    Value(Value),
    Namespace(HashMap<String, Value>),
    /// Expiry recorded for a key that has no value yet (`set_expire` on
    /// an absent key).
    Placeholder,
}

struct Entry {
    payload: Payload,
    created_at: Instant,
    expire: Duration,
}

impl Entry {
    fn new(payload: Payload, expire: Duration) -> Self {
        Self {
            payload,
            created_at: Instant::now(),
            expire,
        }
    }

    fn is_expired(&self) -> bool {
        !self.expire.is_zero() && self.created_at.elapsed() > self.expire
    }
}

fn new_counter() -> Entry {
    Entry::new(Payload::Value(Value::UInt(0)), Duration::ZERO)
}

struct Shared {
    table: RwLock<HashMap<String, Entry>>,
    default_expire: Duration,
}

impl Shared {
    fn resolve_expire(&self, expire: &Expiry) -> Duration {
        expire.head().unwrap_or(self.default_expire)
    }

    /// Remove up to [`GC_BATCH`] expired entries under one exclusive lock.
    fn sweep(&self) -> usize {
        let mut table = self.table.write();
        let doomed: Vec<String> = table
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .take(GC_BATCH)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            table.remove(key);
        }
        doomed.len()
    }
}

/// In-process store.
///
/// One read-write lock guards the whole entry table: reads take the
/// shared lock, mutations the exclusive lock, and counter updates run
/// their whole check-then-mutate sequence under one exclusive lock.
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create a store and start its reaper. Must be called within a
    /// tokio runtime when `gc_interval_secs` is non-zero.
    pub fn new(config: MemoryConfig) -> Self {
        let shared = Arc::new(Shared {
            table: RwLock::new(HashMap::new()),
            default_expire: Duration::from_secs(config.default_expire_secs),
        });

        if config.gc_interval_secs > 0 {
            spawn_reaper(
                Arc::downgrade(&shared),
                Duration::from_secs(config.gc_interval_secs),
            );
        }

        info!(
            gc_interval_secs = config.gc_interval_secs,
            default_expire_secs = config.default_expire_secs,
            "initialized memory store"
        );

        Self { shared }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.shared
            .table
            .read()
            .values()
            .filter(|entry| !entry.is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.shared.table.write().clear();
    }

    fn put_value(&self, key: &str, value: Value, expire: &Expiry) {
        let expire = self.shared.resolve_expire(expire);
        self.shared
            .table
            .write()
            .insert(key.to_string(), Entry::new(Payload::Value(value), expire));
    }

    fn read_value<T>(&self, key: &str, f: impl FnOnce(&Value) -> T) -> Result<T> {
        let table = self.shared.table.read();
        match table.get(key) {
            Some(entry) if !entry.is_expired() => match &entry.payload {
                Payload::Value(value) => Ok(f(value)),
                _ => Err(CacheError::NotFound),
            },
            _ => Err(CacheError::NotFound),
        }
    }

    fn step_counter(&self, key: &str, decrement: bool) -> Result<()> {
        let mut table = self.shared.table.write();
        let entry = table.entry(key.to_string()).or_insert_with(new_counter);
        if entry.is_expired() {
            *entry = new_counter();
        }
        if matches!(entry.payload, Payload::Placeholder) {
            entry.payload = Payload::Value(Value::UInt(0));
        }
        let Payload::Value(value) = &mut entry.payload else {
            return Err(CacheError::Type {
                key: key.into(),
                found: "a namespace",
            });
        };
        if decrement {
            value.decr(key)
        } else {
            value.incr(key)
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, val: &str, expire: &Expiry) -> Result<()> {
        self.put_value(key, Value::Str(val.to_string()), expire);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.read_value(key, Value::render)
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<Vec<String>> {
        let table = self.shared.table.read();
        let values = keys
            .iter()
            .map(|key| match table.get(*key) {
                Some(entry) if !entry.is_expired() => match &entry.payload {
                    Payload::Value(value) => value.render(),
                    _ => String::new(),
                },
                _ => String::new(),
            })
            .collect();
        Ok(values)
    }

    async fn put_object(&self, key: &str, val: serde_json::Value, expire: &Expiry) -> Result<()> {
        self.put_value(key, Value::from_json(val), expire);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<serde_json::Value> {
        self.read_value(key, Value::to_json)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.shared.table.write().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<()> {
        self.step_counter(key, false)
    }

    async fn decr(&self, key: &str) -> Result<()> {
        self.step_counter(key, true)
    }

    async fn exists(&self, key: &str) -> bool {
        let table = self.shared.table.read();
        matches!(table.get(key), Some(entry) if !entry.is_expired())
    }

    async fn set_expire(&self, key: &str, expire: &Expiry) -> Result<()> {
        let Some(duration) = expire.head() else {
            return Ok(());
        };
        let mut table = self.shared.table.write();
        match table.get_mut(key) {
            Some(entry) => {
                entry.created_at = Instant::now();
                entry.expire = duration;
            }
            None => {
                table.insert(key.to_string(), Entry::new(Payload::Placeholder, duration));
            }
        }
        Ok(())
    }

    async fn new_map(&self, name: &str, expire: &Expiry) -> Result<Box<dyn StoreMap>> {
        let timeout = self.shared.resolve_expire(expire);
        let mut table = self.shared.table.write();
        match table.get_mut(name) {
            Some(entry) => {
                // A live namespace keeps its fields with a refreshed
                // window; anything expired or non-namespace is replaced.
                let keep_fields =
                    !entry.is_expired() && matches!(entry.payload, Payload::Namespace(_));
                entry.created_at = Instant::now();
                entry.expire = timeout;
                if !keep_fields {
                    entry.payload = Payload::Namespace(HashMap::new());
                }
            }
            None => {
                table.insert(
                    name.to_string(),
                    Entry::new(Payload::Namespace(HashMap::new()), timeout),
                );
            }
        }
        drop(table);

        Ok(Box::new(MemoryMap {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
        }))
    }
}

/// Handle to a namespace inside a [`MemoryStore`].
///
/// Holds no field data itself; every operation re-verifies the backing
/// entry in the shared table, so concurrent handles to the same name
/// observe the same namespace.
struct MemoryMap {
    shared: Arc<Shared>,
    name: String,
}

impl MemoryMap {
    fn read_fields<T>(&self, f: impl FnOnce(&HashMap<String, Value>) -> Result<T>) -> Result<T> {
        let table = self.shared.table.read();
        match table.get(&self.name) {
            Some(entry) if !entry.is_expired() => match &entry.payload {
                Payload::Namespace(fields) => f(fields),
                _ => Err(CacheError::NotFound),
            },
            _ => Err(CacheError::NotFound),
        }
    }

    fn write_fields<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Value>) -> Result<T>,
    ) -> Result<T> {
        let mut table = self.shared.table.write();
        match table.get_mut(&self.name) {
            Some(entry) if !entry.is_expired() => match &mut entry.payload {
                Payload::Namespace(fields) => f(fields),
                _ => Err(CacheError::NamespaceExpired {
                    name: self.name.clone(),
                }),
            },
            _ => Err(CacheError::NamespaceExpired {
                name: self.name.clone(),
            }),
        }
    }
}

#[async_trait]
impl StoreMap for MemoryMap {
    async fn put(&self, key: &str, val: &str) -> Result<()> {
        self.write_fields(|fields| {
            fields.insert(key.to_string(), Value::Str(val.to_string()));
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.read_fields(|fields| fields.get(key).map(Value::render).ok_or(CacheError::NotFound))
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<Vec<String>> {
        self.read_fields(|fields| {
            Ok(keys
                .iter()
                .map(|key| fields.get(*key).map(Value::render).unwrap_or_default())
                .collect())
        })
    }

    async fn put_object(&self, key: &str, val: serde_json::Value) -> Result<()> {
        self.write_fields(|fields| {
            fields.insert(key.to_string(), Value::from_json(val));
            Ok(())
        })
    }

    async fn get_object(&self, key: &str) -> Result<serde_json::Value> {
        self.read_fields(|fields| fields.get(key).map(Value::to_json).ok_or(CacheError::NotFound))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut table = self.shared.table.write();
        match table.get_mut(&self.name) {
            Some(entry) if !entry.is_expired() => match &mut entry.payload {
                Payload::Namespace(fields) => {
                    fields.remove(key);
                    Ok(())
                }
                _ => Err(CacheError::NotFound),
            },
            _ => Err(CacheError::NotFound),
        }
    }

    async fn incr(&self, key: &str) -> Result<()> {
        self.write_fields(|fields| {
            fields
                .entry(key.to_string())
                .or_insert(Value::UInt(0))
                .incr(key)
        })
    }

    async fn decr(&self, key: &str) -> Result<()> {
        self.write_fields(|fields| {
            fields
                .entry(key.to_string())
                .or_insert(Value::UInt(0))
                .decr(key)
        })
    }

    async fn exists(&self, key: &str) -> bool {
        self.read_fields(|fields| Ok(fields.contains_key(key)))
            .unwrap_or(false)
    }

    async fn len(&self) -> Result<usize> {
        self.read_fields(|fields| Ok(fields.len()))
    }

    async fn clear(&self) -> Result<()> {
        self.write_fields(|fields| {
            fields.clear();
            Ok(())
        })
    }
}

/// Spawn the periodic sweep for a store's entry table. The task holds
/// only a weak handle, so it exits once the store is dropped.
fn spawn_reaper(shared: Weak<Shared>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // Skip the first tick (which fires immediately)
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let removed = shared.sweep();
            if removed > 0 {
                debug!(removed, "reaper removed expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    fn store_with(gc_interval_secs: u64, default_expire_secs: u64) -> MemoryStore {
        MemoryStore::new(MemoryConfig {
            gc_interval_secs,
            default_expire_secs,
        })
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = store_with(0, 0);
        store.put("k", "v", &Expiry::none()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = store_with(0, 0);
        assert!(store.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_default_expire_window() {
        let store = store_with(1, 2);
        store.put("a", "1", &Expiry::none()).await.unwrap();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(store.get("a").await.unwrap(), "1");
        assert!(store.exists("a").await);

        sleep(Duration::from_secs(2)).await;
        assert!(store.get("a").await.unwrap_err().is_not_found());
        assert!(!store.exists("a").await);
    }

    #[tokio::test]
    async fn test_zero_expire_overrides_default() {
        let store = store_with(0, 1);
        store
            .put("k", "v", &Expiry::after(Duration::ZERO))
            .await
            .unwrap();
        sleep(Duration::from_millis(1200)).await;
        assert_eq!(store.get("k").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_incr_on_absent_yields_one() {
        let store = store_with(0, 0);
        store.incr("hits").await.unwrap();
        assert_eq!(store.get("hits").await.unwrap(), "1");
        store.incr("hits").await.unwrap();
        assert_eq!(store.get("hits").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_decr_on_absent_is_range_error() {
        let store = store_with(0, 0);
        let err = store.decr("hits").await.unwrap_err();
        assert!(matches!(err, CacheError::Range { .. }));
        // The counter is left at zero, never negative.
        assert_eq!(store.get("hits").await.unwrap(), "0");
    }

    #[tokio::test]
    async fn test_incr_on_string_is_type_error() {
        let store = store_with(0, 0);
        store.put("k", "v", &Expiry::none()).await.unwrap();
        assert!(matches!(
            store.incr("k").await.unwrap_err(),
            CacheError::Type { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let store = store_with(0, 0);
        store.put("k", "v", &Expiry::none()).await.unwrap();
        assert!(store.exists("k").await);

        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await);
        // Deleting again is not an error.
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_multi_alignment() {
        let store = store_with(0, 0);
        store.put("k1", "v1", &Expiry::none()).await.unwrap();
        store.put("k3", "v3", &Expiry::none()).await.unwrap();

        let values = store.get_multi(&["k1", "k2", "k3"]).await.unwrap();
        assert_eq!(values, vec!["v1".to_string(), String::new(), "v3".to_string()]);
    }

    #[tokio::test]
    async fn test_object_round_trip_preserves_type() {
        let store = store_with(0, 0);
        let obj = json!({"v1": "a", "v2": 2, "v3": 1.5});
        store
            .put_object("obj", obj.clone(), &Expiry::none())
            .await
            .unwrap();
        assert_eq!(store.get_object("obj").await.unwrap(), obj);
    }

    #[tokio::test]
    async fn test_put_json_get_json_round_trip() {
        use crate::store::StoreExt;

        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Session {
            user: String,
            hits: u64,
        }

        let store = store_with(0, 0);
        let session = Session {
            user: "ada".to_string(),
            hits: 3,
        };
        store.put_json("s", &session, &Expiry::none()).await.unwrap();

        let loaded: Session = store.get_json("s").await.unwrap();
        assert_eq!(loaded, session);

        let err = store.get_json::<Session>("missing").await.unwrap_err();
        assert!(err.is_not_found());
        // A value of the wrong shape fails at the codec boundary.
        store.put("bad", "plain", &Expiry::none()).await.unwrap();
        assert!(matches!(
            store.get_json::<Session>("bad").await.unwrap_err(),
            CacheError::Codec(_)
        ));
    }

    #[tokio::test]
    async fn test_len_counts_only_live_entries() {
        let store = store_with(0, 0);
        assert!(store.is_empty());

        store.put("k1", "v", &Expiry::none()).await.unwrap();
        store
            .put("k2", "v", &Expiry::after(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        sleep(Duration::from_millis(1200)).await;
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
        assert!(store.get("k1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_set_expire_resets_window() {
        let store = store_with(0, 0);
        store.put("k", "v", &Expiry::none()).await.unwrap();
        store
            .set_expire("k", &Expiry::after(Duration::from_secs(1)))
            .await
            .unwrap();
        sleep(Duration::from_millis(1200)).await;
        assert!(store.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_set_expire_on_absent_records_placeholder() {
        let store = store_with(0, 0);
        store
            .set_expire("k", &Expiry::after(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(store.exists("k").await);
        assert!(store.get("k").await.unwrap_err().is_not_found());
        // A counter update adopts the placeholder.
        store.incr("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_reaper_removes_expired_entries() {
        let store = store_with(1, 1);
        for i in 0..8 {
            store
                .put(&format!("k{i}"), "v", &Expiry::none())
                .await
                .unwrap();
        }
        sleep(Duration::from_millis(2500)).await;
        // The reaper physically removed the entries, not just hid them.
        assert_eq!(store.shared.table.read().len(), 0);
    }

    #[tokio::test]
    async fn test_map_put_get() {
        let store = store_with(0, 0);
        let map = store.new_map("m", &Expiry::none()).await.unwrap();
        map.put("f", "v").await.unwrap();
        assert_eq!(map.get("f").await.unwrap(), "v");
        assert!(map.exists("f").await);
        assert!(!map.exists("other").await);
        assert_eq!(map.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_map_expiry_law() {
        let store = store_with(0, 0);
        let map = store
            .new_map("m", &Expiry::after(Duration::from_secs(1)))
            .await
            .unwrap();
        // Field writes carry no expiry of their own.
        map.put("f", "v").await.unwrap();
        map.incr("n").await.unwrap();

        sleep(Duration::from_millis(1200)).await;

        assert!(map.get("f").await.unwrap_err().is_not_found());
        assert!(map.get_multi(&["f"]).await.unwrap_err().is_not_found());
        assert!(map.len().await.unwrap_err().is_not_found());
        assert!(!map.exists("f").await);
        assert!(matches!(
            map.put("f", "v2").await.unwrap_err(),
            CacheError::NamespaceExpired { .. }
        ));
        assert!(matches!(
            map.incr("n").await.unwrap_err(),
            CacheError::NamespaceExpired { .. }
        ));
        // The dead namespace was not resurrected by any of the above.
        assert!(!store.exists("m").await);
    }

    #[tokio::test]
    async fn test_new_map_after_expiry_starts_empty() {
        let store = store_with(0, 0);
        let map = store
            .new_map("m", &Expiry::after(Duration::from_secs(1)))
            .await
            .unwrap();
        map.put("f", "v").await.unwrap();

        sleep(Duration::from_millis(1200)).await;

        let map = store
            .new_map("m", &Expiry::after(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(map.len().await.unwrap(), 0);
        assert!(map.get("f").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_new_map_replaces_non_namespace_value() {
        let store = store_with(0, 0);
        store.put("m", "scalar", &Expiry::none()).await.unwrap();
        let map = store.new_map("m", &Expiry::none()).await.unwrap();
        assert_eq!(map.len().await.unwrap(), 0);
        map.put("f", "v").await.unwrap();
        assert_eq!(map.get("f").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_new_map_keeps_live_fields() {
        let store = store_with(0, 0);
        let map = store
            .new_map("m", &Expiry::after(Duration::from_secs(60)))
            .await
            .unwrap();
        map.put("f", "v").await.unwrap();

        let map2 = store
            .new_map("m", &Expiry::after(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(map2.get("f").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_map_handles_share_data() {
        let store = store_with(0, 0);
        let m1 = store.new_map("m", &Expiry::none()).await.unwrap();
        let m2 = store.new_map("m", &Expiry::none()).await.unwrap();

        m1.put("f", "v").await.unwrap();
        assert_eq!(m2.get("f").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_map_counters_and_clear() {
        let store = store_with(0, 0);
        let map = store.new_map("m", &Expiry::none()).await.unwrap();

        map.incr("n").await.unwrap();
        map.incr("n").await.unwrap();
        assert_eq!(map.get("n").await.unwrap(), "2");

        map.decr("n").await.unwrap();
        assert_eq!(map.get("n").await.unwrap(), "1");

        let err = map.decr("fresh").await.unwrap_err();
        assert!(matches!(err, CacheError::Range { .. }));

        map.clear().await.unwrap();
        assert_eq!(map.len().await.unwrap(), 0);
        // The namespace itself survives a clear.
        map.put("f", "v").await.unwrap();
    }

    #[tokio::test]
    async fn test_map_get_multi_alignment() {
        let store = store_with(0, 0);
        let map = store.new_map("m", &Expiry::none()).await.unwrap();
        map.put("a", "1").await.unwrap();
        map.put("c", "3").await.unwrap();

        let values = map.get_multi(&["a", "b", "c"]).await.unwrap();
        assert_eq!(values, vec!["1".to_string(), String::new(), "3".to_string()]);
    }
}
