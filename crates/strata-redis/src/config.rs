//! Redis backend configuration

use serde::Deserialize;
use strata_core::{CacheError, Result};

/// Redis store options, deserialized from the registry's flat option set.
/// Unknown keys are ignored; `addr` is the only required option.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Remote engine address, `host:port` (port defaults to 6379).
    pub addr: String,
    /// AUTH password; empty means no authentication.
    pub password: String,
    /// Database selected on every new connection.
    pub db_num: i64,
    /// Pool capacity.
    pub max_idle_conns: usize,
    /// A pooled connection idle longer than this is discarded on borrow.
    pub conn_idle_timeout_secs: u64,
    /// A pooled connection idle longer than this is liveness-probed
    /// before reuse; under the grace it is handed out without a probe.
    pub conn_test_grace_secs: u64,
    /// Default entry lifetime in seconds. Zero means no TTL unless a
    /// per-call expire is given.
    pub default_expire_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            password: String::new(),
            db_num: 0,
            max_idle_conns: 3,
            conn_idle_timeout_secs: 300,
            conn_test_grace_secs: 60,
            default_expire_secs: 0,
        }
    }
}

impl RedisConfig {
    /// Parse from a flat JSON option set and validate required options.
    pub fn from_json(config: &str) -> Result<Self> {
        let config: Self = if config.trim().is_empty() {
            Self::default()
        } else {
            serde_json::from_str(config)
                .map_err(|e| CacheError::Config(format!("redis config: {e}")))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(CacheError::Config("redis config has no addr".into()));
        }
        Ok(())
    }

    pub(crate) fn host_port(&self) -> Result<(String, u16)> {
        match self.addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    CacheError::Config(format!("invalid port in redis addr {:?}", self.addr))
                })?;
                Ok((host.to_string(), port))
            }
            None => Ok((self.addr.clone(), 6379)),
        }
    }
}
