//! Connection pooling
//!
//! Connections are multiplexed and reused through a managed pool. A
//! connection that sat idle past `conn_idle_timeout_secs` is discarded on
//! borrow; one idle past `conn_test_grace_secs` is PINGed before reuse,
//! and under the grace it is handed out without a probe.

use std::time::Duration;

use deadpool::managed::{Manager, Metrics, Pool, RecycleError, RecycleResult};
use redis::aio::MultiplexedConnection;
use tracing::debug;

pub(crate) type RedisPool = Pool<ConnectionManager>;

pub(crate) struct ConnectionManager {
    client: redis::Client,
    idle_timeout: Duration,
    test_grace: Duration,
}

impl ConnectionManager {
    pub(crate) fn new(
        client: redis::Client,
        idle_timeout: Duration,
        test_grace: Duration,
    ) -> Self {
        Self {
            client,
            idle_timeout,
            test_grace,
        }
    }
}

impl Manager for ConnectionManager {
    type Type = MultiplexedConnection;
    type Error = redis::RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn recycle(
        &self,
        conn: &mut MultiplexedConnection,
        metrics: &Metrics,
    ) -> RecycleResult<redis::RedisError> {
        let idle = metrics.last_used();
        if !self.idle_timeout.is_zero() && idle > self.idle_timeout {
            return Err(RecycleError::Message("connection idle past timeout".into()));
        }
        if idle > self.test_grace {
            debug!(idle_secs = idle.as_secs(), "probing idle connection");
            redis::cmd("PING")
                .query_async::<()>(conn)
                .await
                .map_err(RecycleError::Backend)?;
        }
        Ok(())
    }
}
