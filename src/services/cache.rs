//! Redis cache for vision model results.
//!
//! Model calls are slow and billed per token, so results are cached by the
//! SHA-256 of the document bytes. Every failure here degrades to a cache miss.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Redis cache client with connection pooling.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    default_ttl: Duration,
}

impl RedisCache {
    /// Create a new Redis cache connection.
    pub async fn new(redis_url: &str, default_ttl_seconds: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        tracing::info!("Redis cache connected");

        Ok(Self {
            conn,
            default_ttl: Duration::from_secs(default_ttl_seconds),
        })
    }

    /// Get a value from cache; errors and undecodable entries are misses.
    #[instrument(skip(self), fields(cache_hit))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone();

        let hit = match conn.get::<_, Option<String>>(key).await {
            Ok(Some(data)) => match serde_json::from_str(&data) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = key, error = %e, "Dropping undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = key, error = %e, "Redis get error");
                None
            }
        };

        tracing::Span::current().record("cache_hit", hit.is_some());
        debug!(key = key, hit = hit.is_some(), "Cache lookup");
        hit
    }

    /// Store a value with the default TTL. Failures are logged, not returned.
    #[instrument(skip(self, value))]
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = self.set_with_ttl(key, value, self.default_ttl).await {
            warn!(key = key, error = %e, "Failed to write cache entry");
        }
    }

    async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();

        let data = serde_json::to_string(value).context("Failed to serialize value for cache")?;

        conn.set_ex::<_, _, ()>(key, data, ttl.as_secs())
            .await
            .context("Failed to set cache value")?;

        debug!(key = key, ttl_secs = ttl.as_secs(), "Cached value");
        Ok(())
    }

    /// Check if Redis is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;
        Ok(())
    }
}

/// Cache key builders. The model name is part of every key so switching
/// models does not serve stale answers.
pub mod keys {
    use crate::domain::extraction::ExtractionMode;

    /// Extraction result for a document
    pub fn extraction(model: &str, content_hash: &str, mode: ExtractionMode) -> String {
        format!("vision:{}:extract:{}:{}", model, mode.as_str(), content_hash)
    }

    /// Categorization result for a document
    pub fn categorization(model: &str, content_hash: &str) -> String {
        format!("vision:{}:categorize:{}", model, content_hash)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn keys_separate_modes_and_models() {
            let hash = "ab12";
            assert_ne!(
                extraction("m1", hash, ExtractionMode::Standard),
                extraction("m1", hash, ExtractionMode::Comprehensive)
            );
            assert_ne!(
                extraction("m1", hash, ExtractionMode::Standard),
                extraction("m2", hash, ExtractionMode::Standard)
            );
            assert_eq!(categorization("m1", hash), "vision:m1:categorize:ab12");
        }
    }
}
