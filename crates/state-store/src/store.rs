use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Result, Version};

/// Options for writing an entry.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Expected version of the entry for optimistic concurrency control.
    /// If None, the write is unconditional (last writer wins).
    pub expected_version: Option<Version>,
    /// How long the entry stays readable. If None, it never expires.
    pub ttl: Option<Duration>,
}

impl SaveOptions {
    /// Creates options for an unconditional write without expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the entry to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
            ttl: None,
        }
    }

    /// Creates options expecting the key to hold nothing yet.
    pub fn expect_new() -> Self {
        Self::expect_version(Version::initial())
    }

    /// Sets the time-to-live of the written entry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A value read back from the store together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: String,
    pub version: Version,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Core trait for state store implementations.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the live entry for `key`, if any. Expired entries read as absent.
    async fn get_state(&self, key: &str) -> Result<Option<StoredValue>>;

    /// Writes `value` under `key` and returns the new version.
    ///
    /// If `options.expected_version` is set, the write fails with
    /// `ConcurrencyConflict` unless the current version matches.
    async fn save_state(&self, key: &str, value: String, options: SaveOptions) -> Result<Version>;

    /// Removes the entry for `key`. Removing a missing key is not an error.
    async fn delete_state(&self, key: &str) -> Result<()>;
}

/// JSON helpers on top of any [`StateStore`].
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Reads and deserializes the entry for `key`.
    async fn get_json<T>(&self, key: &str) -> Result<Option<(T, Version)>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_state(key).await? {
            Some(stored) => {
                let value = serde_json::from_str(&stored.value)?;
                Ok(Some((value, stored.version)))
            }
            None => Ok(None),
        }
    }

    /// Serializes and writes `value` under `key`.
    async fn save_json<T>(&self, key: &str, value: &T, options: SaveOptions) -> Result<Version>
    where
        T: Serialize + Sync,
    {
        let json = serde_json::to_string(value)?;
        self.save_state(key, json, options).await
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}
