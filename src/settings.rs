//! Process-wide settings cache (Design Note §9).
//!
//! Wraps the `settings` table behind an in-memory `HashMap` guarded by a
//! `tokio::sync::RwLock`, with an `AtomicU64` version counter bumped on every
//! write. Readers that only need "is this still current" can compare
//! versions without touching the database; `get` always serves from cache
//! and falls through to `sqlx` only on a cache miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::db::core as db;
use crate::error::Result;

#[derive(Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, String>>>,
    version: Arc<AtomicU64>,
}

impl SettingsStore {
    /// Load the entire `settings` table into cache at startup.
    pub async fn load(pool: SqlitePool) -> Result<Self> {
        let rows = db::list_settings(&pool).await?;
        let cache = rows.into_iter().collect::<HashMap<_, _>>();

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            version: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Current cache version, bumped by every successful `set`. Callers that
    /// cached a derived value alongside a version can skip recomputing it
    /// when the version hasn't moved.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.cache.read().await.get(key).cloned()
    }

    pub async fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).await.unwrap_or_else(|| default.to_string())
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).await {
            Some(v) => v == "true" || v == "1",
            None => default,
        }
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.get(key).await {
            Some(v) => v.parse().unwrap_or(default),
            None => default,
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        db::set_setting(&self.pool, key, value).await?;
        self.cache
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub async fn all(&self) -> HashMap<String, String> {
        self.cache.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_reads_through_cache() {
        let pool = db::init_db("sqlite::memory:").await.unwrap();
        let store = SettingsStore::load(pool).await.unwrap();

        assert_eq!(store.get("max_workers").await, None);
        store.set("max_workers", "4").await.unwrap();
        assert_eq!(store.get_i64("max_workers", 1).await, 4);
    }

    #[tokio::test]
    async fn version_increments_on_write() {
        let pool = db::init_db("sqlite::memory:").await.unwrap();
        let store = SettingsStore::load(pool).await.unwrap();
        let before = store.version();
        store.set("foo", "bar").await.unwrap();
        assert!(store.version() > before);
    }

    #[tokio::test]
    async fn get_bool_parses_truthy_forms() {
        let pool = db::init_db("sqlite::memory:").await.unwrap();
        let store = SettingsStore::load(pool).await.unwrap();
        store.set("enable_comment", "true").await.unwrap();
        assert!(store.get_bool("enable_comment", false).await);
        assert!(!store.get_bool("missing_key", false).await);
    }
}
