//! # Lockstep Redis
//!
//! A [`LeaseBackend`] on Redis, for use with `DistributedLock` from
//! `lockstep-runtime`, and [`RedisCache`], a typed JSON cache sharing the
//! same connection handling.
//!
//! # Architecture
//!
//! One string key per lease, holding the owner's token, with a millisecond
//! TTL enforced by Redis:
//!
//! - **acquire**: `SET key token NX PX ttl`
//! - **extend**: Lua, `PEXPIRE key ttl` only if `GET key == token`
//! - **release**: Lua, `DEL key` only if `GET key == token`
//!
//! The owner check and the write run in one script, so a holder whose lease
//! expired and was taken over can never extend or delete the new owner's lease.
//!
//! # Example
//!
//! ```no_run
//! use lockstep_core::Lockable;
//! use lockstep_redis::RedisLeaseBackend;
//! use lockstep_runtime::{DistributedLock, LockOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = RedisLeaseBackend::new("redis://127.0.0.1:6379").await?;
//! let mut lock = DistributedLock::new(backend, "orders_partition_0", LockOptions::new());
//! lock.acquire().await?;
//! lock.release().await?;
//! # Ok(())
//! # }
//! ```

mod cache;

pub use cache::{DEFAULT_CACHE_TTL, RedisCache};

use lockstep_core::{LeaseBackend, LockError};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;

const EXTEND_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 0
";

const RELEASE_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

/// Lease store on a shared Redis connection.
///
/// Cloning is cheap; clones share the underlying connection manager, which
/// reconnects on its own after network failures.
#[derive(Clone)]
pub struct RedisLeaseBackend {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    extend_script: Script,
    release_script: Script,
}

impl RedisLeaseBackend {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the URL is invalid or the connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = Client::open(redis_url)
            .map_err(|e| LockError::Backend(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            LockError::Backend(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!("Redis lease backend connected");
        Ok(Self::from_manager(conn_manager))
    }

    /// Connect using the `REDIS_URL` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the variable is unset or the connection fails.
    pub async fn from_env() -> Result<Self, LockError> {
        let url = std::env::var("REDIS_URL")
            .map_err(|_| LockError::Backend("REDIS_URL is not set".to_string()))?;
        Self::new(&url).await
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            extend_script: Script::new(EXTEND_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    /// The shared connection manager, for building a [`RedisCache`] on the
    /// same connection.
    #[must_use]
    pub fn connection_manager(&self) -> ConnectionManager {
        self.conn_manager.clone()
    }
}

impl LeaseBackend for RedisLeaseBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();

        // SET NX answers OK when the key was written and nil when it already existed
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("Failed to acquire lease '{key}': {e}")))?;

        Ok(reply.is_some())
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();

        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("Failed to extend lease '{key}': {e}")))?;

        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();

        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("Failed to release lease '{key}': {e}")))?;

        Ok(deleted == 1)
    }
}

/// Lease duration in whole milliseconds, at least 1.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
