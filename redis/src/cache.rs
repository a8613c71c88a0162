//! Typed JSON cache of domain values.
//!
//! Each [`RedisCache`] stores one value type under its own key prefix. A
//! cache miss, an undecodable entry and an unreachable Redis all look the
//! same to the caller: `None` from [`get`](RedisCache::get), a silent no-op
//! from the writes. Failures are logged.

use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::marker::PhantomData;
use std::time::Duration;

use crate::ttl_millis;

/// Default time-to-live for cache entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Maximum TTL deviation, in percent of the configured TTL.
const JITTER_PERCENT: i64 = 10;

/// Redis-backed cache of `T` values, serialized as JSON.
///
/// Entries live under `:{prefix}:{id}`. The prefix defaults to the
/// `snake_case` name of `T` (`OrderSummary` → `order_summary`). Every write
/// sets a TTL randomly spread ±10% around the configured one, so a burst of
/// writes does not expire all at once.
///
/// # Example
///
/// ```no_run
/// use lockstep_redis::RedisCache;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderSummary {
///     id: u64,
///     total_cents: i64,
/// }
///
/// # async fn example() -> Result<(), redis::RedisError> {
/// let cache = RedisCache::<OrderSummary>::connect("redis://127.0.0.1:6379").await?;
///
/// cache.create(&42, &OrderSummary { id: 42, total_cents: 1_999 }).await;
/// let cached = cache.get(&42).await;
/// assert!(cached.is_some());
/// # Ok(())
/// # }
/// ```
pub struct RedisCache<T> {
    conn_manager: ConnectionManager,
    prefix: String,
    ttl: Duration,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for RedisCache<T> {
    fn clone(&self) -> Self {
        Self {
            conn_manager: self.conn_manager.clone(),
            prefix: self.prefix.clone(),
            ttl: self.ttl,
            _value: PhantomData,
        }
    }
}

impl<T> RedisCache<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Cache on an existing connection manager, e.g. the one of a
    /// [`RedisLeaseBackend`](crate::RedisLeaseBackend).
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            prefix: type_prefix::<T>(),
            ttl: DEFAULT_CACHE_TTL,
            _value: PhantomData,
        }
    }

    /// Connect to Redis at `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns the [`RedisError`] if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, RedisError> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self::from_manager(conn_manager))
    }

    /// Store entries under `prefix` instead of the type name.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the base time-to-live of new entries.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Key prefix in use.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Base time-to-live, before jitter.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Redis key for `id`.
    pub fn key(&self, id: &impl Display) -> String {
        format!(":{}:{id}", self.prefix)
    }

    /// The cached value for `id`.
    ///
    /// Returns `None` on a miss, on an entry that no longer decodes as `T`,
    /// and when Redis is unavailable.
    pub async fn get(&self, id: &impl Display) -> Option<T> {
        let key = self.key(id);
        let mut conn = self.conn_manager.clone();

        let raw: Option<String> = match redis::cmd("GET").arg(&key).query_async(&mut conn).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "Cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw?) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::debug!(key = %key, error = %error, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Cache `value` under `id`, replacing any existing entry.
    pub async fn create(&self, id: &impl Display, value: &T) {
        let key = self.key(id);
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "Failed to serialize cache entry");
                return;
            }
        };
        let ttl = jittered(self.ttl);
        let mut conn = self.conn_manager.clone();

        let written: Result<(), RedisError> = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await;
        match written {
            Ok(()) => tracing::debug!(key = %key, ttl_ms = ttl_millis(ttl), "Cache entry written"),
            Err(error) => tracing::warn!(key = %key, error = %error, "Cache write failed"),
        }
    }

    /// Same as [`create`](Self::create).
    pub async fn update(&self, id: &impl Display, value: &T) {
        self.create(id, value).await;
    }

    /// Remove the entry for `id`, if any.
    pub async fn delete(&self, id: &impl Display) {
        let key = self.key(id);
        let mut conn = self.conn_manager.clone();

        let deleted: Result<i64, RedisError> =
            redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
        if let Err(error) = deleted {
            tracing::warn!(key = %key, error = %error, "Cache delete failed");
        }
    }
}

/// `ttl` moved by a random amount of at most 10% either way, never under 1ms.
fn jittered(ttl: Duration) -> Duration {
    let base = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let spread = base / 100 * JITTER_PERCENT;
    let offset = if spread > 0 {
        rand::thread_rng().gen_range(-spread..=spread)
    } else {
        0
    };
    let millis = u64::try_from(base.saturating_add(offset)).unwrap_or(0).max(1);
    Duration::from_millis(millis)
}

/// `snake_case` name of `T` without its module path or generic arguments.
fn type_prefix<T>() -> String {
    let full = std::any::type_name::<T>();
    let bare = full.split('<').next().unwrap_or(full);
    let name = bare.rsplit("::").next().unwrap_or(bare);
    snake_case(name)
}

fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let after_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let ends_acronym = i > 0
                && chars[i - 1].is_uppercase()
                && chars.get(i + 1).is_some_and(|next| next.is_lowercase());
            if after_lower || ends_acronym {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
