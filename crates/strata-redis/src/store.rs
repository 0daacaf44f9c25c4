//! Redis-backed store
//!
//! Values are stored as raw strings (objects as JSON text) and expiry is
//! delegated to the engine's native TTLs: a positive expire issues SETEX,
//! a zero one a plain SET. Counters map onto INCRBY so they stay atomic
//! across processes sharing the database.

use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{Object, Pool};
use redis::aio::MultiplexedConnection;
use tracing::{info, warn};

use strata_core::{CacheError, Expiry, Result, Store, StoreMap};

use crate::config::RedisConfig;
use crate::pool::{ConnectionManager, RedisPool};

pub struct RedisStore {
    pool: RedisPool,
    default_expire: Duration,
}

impl RedisStore {
    /// Build the pool and verify the engine is reachable. An unreachable
    /// or misconfigured engine fails construction with a `Config` error.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        config.validate()?;
        let (host, port) = config.host_port()?;
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db: config.db_num,
                username: None,
                password: (!config.password.is_empty()).then(|| config.password.clone()),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)
            .map_err(|e| CacheError::Config(format!("redis client: {e}")))?;
        let manager = ConnectionManager::new(
            client,
            Duration::from_secs(config.conn_idle_timeout_secs),
            Duration::from_secs(config.conn_test_grace_secs),
        );
        let pool: RedisPool = Pool::builder(manager)
            .max_size(config.max_idle_conns)
            .build()
            .map_err(|e| CacheError::Config(format!("redis pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| CacheError::Config(format!("redis connect: {e}")))?;
        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| CacheError::Config(format!("redis ping: {e}")))?;
        drop(conn);

        info!(addr = %config.addr, db = config.db_num, "connected redis store");
        Ok(Self {
            pool,
            default_expire: Duration::from_secs(config.default_expire_secs),
        })
    }

    async fn conn(&self) -> Result<Object<ConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Transport(format!("pool: {e}")))
    }

    fn expire_secs(&self, expire: &Expiry) -> u64 {
        expire.head().unwrap_or(self.default_expire).as_secs()
    }

    async fn put_raw(&self, key: &str, payload: &str, expire: &Expiry) -> Result<()> {
        let mut conn = self.conn().await?;
        let ttl = self.expire_secs(expire);
        if ttl > 0 {
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl)
                .arg(payload)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(transport)
        } else {
            redis::cmd("SET")
                .arg(key)
                .arg(payload)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(transport)
        }
    }

    async fn get_raw(&self, key: &str) -> Result<String> {
        let mut conn = self.conn().await?;
        let val: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(transport)?;
        val.ok_or(CacheError::NotFound)
    }

    async fn step(&self, key: &str, delta: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(transport)?;
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn put(&self, key: &str, val: &str, expire: &Expiry) -> Result<()> {
        self.put_raw(key, val, expire).await
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.get_raw(key).await
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let vals: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut *conn)
            .await
            .map_err(transport)?;
        Ok(vals.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn put_object(&self, key: &str, val: serde_json::Value, expire: &Expiry) -> Result<()> {
        let payload = serde_json::to_string(&val)?;
        self.put_raw(key, &payload, expire).await
    }

    async fn get_object(&self, key: &str) -> Result<serde_json::Value> {
        let payload = self.get_raw(key).await?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<()> {
        self.step(key, 1).await
    }

    async fn decr(&self, key: &str) -> Result<()> {
        self.step(key, -1).await
    }

    async fn exists(&self, key: &str) -> bool {
        let result: Result<bool> = async {
            let mut conn = self.conn().await?;
            redis::cmd("EXISTS")
                .arg(key)
                .query_async::<bool>(&mut *conn)
                .await
                .map_err(transport)
        }
        .await;
        match result {
            Ok(found) => found,
            Err(e) => {
                warn!(key, error = %e, "existence check failed, reading as absent");
                false
            }
        }
    }

    async fn set_expire(&self, key: &str, expire: &Expiry) -> Result<()> {
        // EXPIRE with zero seconds would delete the key, so a "never
        // expires" head is left alone here.
        let Some(d) = expire.head() else {
            return Ok(());
        };
        if d.is_zero() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(d.as_secs())
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn new_map(&self, name: &str, expire: &Expiry) -> Result<Box<dyn StoreMap>> {
        Ok(Box::new(RedisMap {
            pool: self.pool.clone(),
            name: name.to_string(),
            expire_secs: self.expire_secs(expire),
        }))
    }
}

/// Namespace handle over one engine-side hash.
///
/// The hash carries a single TTL, applied once right after its first
/// field write; later writes never refresh it, so the whole namespace
/// expires as one unit.
struct RedisMap {
    pool: RedisPool,
    name: String,
    expire_secs: u64,
}

impl RedisMap {
    async fn conn(&self) -> Result<Object<ConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Transport(format!("pool: {e}")))
    }

    async fn hash_exists(&self, conn: &mut MultiplexedConnection) -> Result<bool> {
        redis::cmd("EXISTS")
            .arg(&self.name)
            .query_async::<bool>(conn)
            .await
            .map_err(transport)
    }

    async fn expire_after_first_write(
        &self,
        conn: &mut MultiplexedConnection,
        existed: bool,
    ) -> Result<()> {
        if self.expire_secs > 0 && !existed {
            redis::cmd("EXPIRE")
                .arg(&self.name)
                .arg(self.expire_secs)
                .query_async::<i64>(conn)
                .await
                .map_err(transport)?;
        }
        Ok(())
    }

    async fn put_field(&self, key: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let existed = if self.expire_secs > 0 {
            self.hash_exists(&mut conn).await?
        } else {
            true
        };
        redis::cmd("HSET")
            .arg(&self.name)
            .arg(key)
            .arg(payload)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(transport)?;
        self.expire_after_first_write(&mut conn, existed).await
    }

    async fn get_field(&self, key: &str) -> Result<String> {
        let mut conn = self.conn().await?;
        let val: Option<String> = redis::cmd("HGET")
            .arg(&self.name)
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(transport)?;
        val.ok_or(CacheError::NotFound)
    }

    async fn step_field(&self, key: &str, delta: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let existed = if self.expire_secs > 0 {
            self.hash_exists(&mut conn).await?
        } else {
            true
        };
        redis::cmd("HINCRBY")
            .arg(&self.name)
            .arg(key)
            .arg(delta)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(transport)?;
        self.expire_after_first_write(&mut conn, existed).await
    }
}

#[async_trait]
impl StoreMap for RedisMap {
    async fn put(&self, key: &str, val: &str) -> Result<()> {
        self.put_field(key, val).await
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.get_field(key).await
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let vals: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.name)
            .arg(keys)
            .query_async(&mut *conn)
            .await
            .map_err(transport)?;
        Ok(vals.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn put_object(&self, key: &str, val: serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(&val)?;
        self.put_field(key, &payload).await
    }

    async fn get_object(&self, key: &str) -> Result<serde_json::Value> {
        let payload = self.get_field(key).await?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("HDEL")
            .arg(&self.name)
            .arg(key)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<()> {
        self.step_field(key, 1).await
    }

    async fn decr(&self, key: &str) -> Result<()> {
        self.step_field(key, -1).await
    }

    async fn exists(&self, key: &str) -> bool {
        let result: Result<bool> = async {
            let mut conn = self.conn().await?;
            redis::cmd("HEXISTS")
                .arg(&self.name)
                .arg(key)
                .query_async::<bool>(&mut *conn)
                .await
                .map_err(transport)
        }
        .await;
        match result {
            Ok(found) => found,
            Err(e) => {
                warn!(map = %self.name, key, error = %e, "existence check failed, reading as absent");
                false
            }
        }
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn().await?;
        let n: i64 = redis::cmd("HLEN")
            .arg(&self.name)
            .query_async(&mut *conn)
            .await
            .map_err(transport)?;
        Ok(n as usize)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(&self.name)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(transport)?;
        Ok(())
    }
}

fn transport(e: redis::RedisError) -> CacheError {
    CacheError::Transport(e.to_string())
}

// These tests need a redis at 127.0.0.1:6379 (`docker run -p 6379:6379
// redis`); run them with `cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strata_core::Value;

    use super::*;

    async fn test_store(default_expire_secs: u64) -> RedisStore {
        let config = RedisConfig {
            addr: "127.0.0.1:6379".to_string(),
            default_expire_secs,
            ..RedisConfig::default()
        };
        RedisStore::connect(config).await.unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_put_get_roundtrip() {
        let store = test_store(0).await;
        store
            .put("strata:test:rt", "value1", &Expiry::none())
            .await
            .unwrap();
        assert_eq!(store.get("strata:test:rt").await.unwrap(), "value1");
        store.delete("strata:test:rt").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_get_absent_is_not_found() {
        let store = test_store(0).await;
        let err = store.get("strata:test:absent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    #[ignore]
    async fn test_per_call_expire_uses_native_ttl() {
        let store = test_store(0).await;
        store
            .put(
                "strata:test:ttl",
                "v",
                &Expiry::after(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(store.get("strata:test:ttl").await.unwrap(), "v");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(store.get("strata:test:ttl").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    #[ignore]
    async fn test_get_multi_aligns_with_keys() {
        let store = test_store(0).await;
        store
            .put("strata:test:m1", "a", &Expiry::none())
            .await
            .unwrap();
        store
            .put("strata:test:m3", "c", &Expiry::none())
            .await
            .unwrap();

        let vals = store
            .get_multi(&["strata:test:m1", "strata:test:m2", "strata:test:m3"])
            .await
            .unwrap();
        assert_eq!(vals, vec!["a".to_string(), String::new(), "c".to_string()]);

        assert!(store.get_multi(&[]).await.unwrap().is_empty());

        store.delete("strata:test:m1").await.unwrap();
        store.delete("strata:test:m3").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_object_round_trip() {
        let store = test_store(0).await;
        let val = serde_json::json!({"id": 7, "name": "anchor"});
        store
            .put_object("strata:test:obj", val.clone(), &Expiry::none())
            .await
            .unwrap();
        assert_eq!(store.get_object("strata:test:obj").await.unwrap(), val);
        store.delete("strata:test:obj").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_counters() {
        let store = test_store(0).await;
        store.delete("strata:test:ctr").await.unwrap();

        store.incr("strata:test:ctr").await.unwrap();
        store.incr("strata:test:ctr").await.unwrap();
        store.decr("strata:test:ctr").await.unwrap();
        assert_eq!(store.get("strata:test:ctr").await.unwrap(), "1");

        store.delete("strata:test:ctr").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_exists_and_delete() {
        let store = test_store(0).await;
        store
            .put("strata:test:ex", "v", &Expiry::none())
            .await
            .unwrap();
        assert!(store.exists("strata:test:ex").await);

        store.delete("strata:test:ex").await.unwrap();
        assert!(!store.exists("strata:test:ex").await);

        // Deleting again is not an error.
        store.delete("strata:test:ex").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_map_fields_share_one_namespace() {
        let store = test_store(0).await;
        store.delete("strata:test:map").await.unwrap();

        let map = store
            .new_map("strata:test:map", &Expiry::none())
            .await
            .unwrap();
        map.put("f1", "a").await.unwrap();
        map.put("f2", "b").await.unwrap();
        map.incr("n").await.unwrap();

        assert_eq!(map.get("f1").await.unwrap(), "a");
        assert_eq!(
            map.get_multi(&["f1", "missing", "f2"]).await.unwrap(),
            vec!["a".to_string(), String::new(), "b".to_string()]
        );
        assert_eq!(map.len().await.unwrap(), 3);
        assert!(map.exists("f2").await);

        map.delete("f2").await.unwrap();
        assert!(!map.exists("f2").await);
        assert!(map.get("f2").await.unwrap_err().is_not_found());

        map.clear().await.unwrap();
        assert_eq!(map.len().await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_map_ttl_applied_once() {
        let store = test_store(0).await;
        store.delete("strata:test:mapttl").await.unwrap();

        let map = store
            .new_map("strata:test:mapttl", &Expiry::after(Duration::from_secs(100)))
            .await
            .unwrap();
        map.put("f1", "a").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        map.put("f2", "b").await.unwrap();

        // The second write must not refresh the namespace TTL.
        let mut conn = store.conn().await.unwrap();
        let ttl: i64 = redis::cmd("TTL")
            .arg("strata:test:mapttl")
            .query_async(&mut *conn)
            .await
            .unwrap();
        assert!(ttl > 0 && ttl <= 99, "ttl was {ttl}");

        store.delete("strata:test:mapttl").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_scalar_values_render_like_memory_tier() {
        // Counter state written by incr reads back through the same
        // rendering the in-process tier uses.
        let store = test_store(0).await;
        store.delete("strata:test:render").await.unwrap();

        store.incr("strata:test:render").await.unwrap();
        let raw = store.get("strata:test:render").await.unwrap();
        assert_eq!(raw, Value::UInt(1).render());

        store.delete("strata:test:render").await.unwrap();
    }
}
