use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{Result, SaveOptions, StateStore, StateStoreError, StoredValue, Version};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: Version,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory state store.
///
/// Provides the same versioning and expiry semantics a shared key-value
/// store would. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryStateStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live entries.
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Returns true if no live entry exists.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every expired entry and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_state(&self, key: &str) -> Result<Option<StoredValue>> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| StoredValue {
                value: e.value.clone(),
                version: e.version,
                expires_at: e.expires_at,
            }))
    }

    async fn save_state(&self, key: &str, value: String, options: SaveOptions) -> Result<Version> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;

        // An expired entry behaves like a key that was never written.
        let current_version = entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.version)
            .unwrap_or(Version::initial());

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            metrics::counter!("state_store_conflicts_total").increment(1);
            return Err(StateStoreError::ConcurrencyConflict {
                key: key.to_string(),
                expected,
                actual: current_version,
            });
        }

        let expires_at = match options.ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|e| StateStoreError::Unavailable(format!("invalid ttl: {e}")))?;
                Some(now + ttl)
            }
            None => None,
        };

        let version = current_version.next();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at,
            },
        );
        tracing::trace!(key, %version, "state saved");

        Ok(version)
    }

    async fn delete_state(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
