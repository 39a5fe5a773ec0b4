// src/session.rs

use crate::error::NilaOidcError;
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};
use tracing::debug;

/// Server-side storage for pending login attempts and completed logins.
///
/// Values are opaque strings (the relying party stores JSON). Every entry is
/// written with a TTL and must disappear once it has passed.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, NilaOidcError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), NilaOidcError>;

    async fn delete(&self, key: &str) -> Result<(), NilaOidcError>;

    /// Removes and returns an entry. Of two concurrent callers, at most one may
    /// see the value.
    ///
    /// The provided implementation is a plain get-then-delete and is only
    /// atomic if the store serializes access itself; override it otherwise.
    async fn take(&self, key: &str) -> Result<Option<String>, NilaOidcError> {
        let value = self.get(key).await?;
        if value.is_some() {
            self.delete(key).await?;
        }
        Ok(value)
    }

    /// Evicts expired entries. Stores with native expiry need not do anything.
    async fn reap(&self) -> Result<(), NilaOidcError> {
        Ok(())
    }
}

#[derive(Clone)]
struct StoredValue {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &StoredValue, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// An in-process store on a `moka` cache. Entries are lost on restart.
#[derive(Clone)]
pub struct MemorySessionStore {
    cache: Cache<String, StoredValue>,
}

impl MemorySessionStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).expire_after(PerEntryTtl).build(),
        }
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>, NilaOidcError> {
        Ok(self.cache.get(key).await.map(|stored| stored.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), NilaOidcError> {
        self.cache.insert(key.to_string(), StoredValue { value, ttl }).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), NilaOidcError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, NilaOidcError> {
        Ok(self.cache.remove(key).await.map(|stored| stored.value))
    }

    async fn reap(&self) -> Result<(), NilaOidcError> {
        self.cache.run_pending_tasks().await;
        debug!(entries = self.cache.entry_count(), "Session store maintenance done");
        Ok(())
    }
}

#[cfg(feature = "redis-store")]
pub use self::redis_store::RedisSessionStore;

#[cfg(feature = "redis-store")]
mod redis_store {
    use super::SessionStore;
    use crate::error::NilaOidcError;
    use async_trait::async_trait;
    use redis::AsyncCommands;
    use std::sync::Arc;
    use std::time::Duration;

    /// A store shared between processes. Keys are namespaced and expire in Redis.
    #[derive(Clone)]
    pub struct RedisSessionStore {
        client: redis::Client,
        namespace: Arc<str>,
    }

    impl RedisSessionStore {
        pub fn new(client: redis::Client) -> Self {
            Self {
                client,
                namespace: Arc::from("nila-oidc-rp"),
            }
        }

        /// Opens a client for `url`, e.g. `redis://127.0.0.1/`.
        pub fn open(url: &str) -> Result<Self, NilaOidcError> {
            let client = redis::Client::open(url).map_err(store_error)?;
            Ok(Self::new(client))
        }

        pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
            self.namespace = Arc::from(namespace.into());
            self
        }

        fn key(&self, key: &str) -> String {
            format!("{}:{key}", self.namespace)
        }

        async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, NilaOidcError> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(store_error)
        }
    }

    fn store_error(e: redis::RedisError) -> NilaOidcError {
        NilaOidcError::SessionStore(e.to_string())
    }

    #[async_trait]
    impl SessionStore for RedisSessionStore {
        async fn get(&self, key: &str) -> Result<Option<String>, NilaOidcError> {
            let mut conn = self.connection().await?;
            conn.get(self.key(key)).await.map_err(store_error)
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), NilaOidcError> {
            let mut conn = self.connection().await?;
            let ttl_secs = ttl.as_secs().max(1);
            conn.set_ex::<_, _, ()>(self.key(key), value, ttl_secs)
                .await
                .map_err(store_error)
        }

        async fn delete(&self, key: &str) -> Result<(), NilaOidcError> {
            let mut conn = self.connection().await?;
            conn.del::<_, ()>(self.key(key)).await.map_err(store_error)
        }

        async fn take(&self, key: &str) -> Result<Option<String>, NilaOidcError> {
            let mut conn = self.connection().await?;
            conn.get_del(self.key(key)).await.map_err(store_error)
        }
    }
}
