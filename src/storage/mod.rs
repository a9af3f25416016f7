//! Named cache partitions.
//!
//! A partition maps a [`CacheKey`] (the identity of a GET request) to a
//! [`StoredResponse`]. Partitions are listed in creation order, which is
//! also the order [`CacheStorage::lookup_any`] searches them in.

mod disk;
mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::error::Result;
use crate::http::{Request, Response};

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

/// Identity of a cached request: the URL of a GET request without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds the key for a URL.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(url.into())
    }

    /// Builds the key for a request. Only GET requests are cacheable.
    #[must_use]
    pub fn for_request(request: &Request) -> Option<Self> {
        request.is_get().then(|| Self::from_url(&request.url))
    }

    /// Returns the key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A response held in a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub response: Response,
    pub cached_at: DateTime<Utc>,
}

impl StoredResponse {
    /// Wraps a response stamped with the current time.
    #[must_use]
    pub fn now(response: Response) -> Self {
        Self {
            response,
            cached_at: Utc::now(),
        }
    }
}

/// Abstraction over cache partition storage.
///
/// Writes to a partition that does not exist yet create it, mirroring
/// `open` followed by `put`.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Creates the partition if it does not exist.
    async fn open(&self, name: &str) -> Result<()>;

    /// Returns true if the partition exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// Lists partition names in creation order.
    async fn names(&self) -> Result<Vec<String>>;

    /// Deletes a partition and every entry in it. Returns false if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Stores a response, replacing any previous entry for the key.
    async fn put(&self, partition: &str, key: &CacheKey, response: &Response) -> Result<()>;

    /// Stores a batch of responses. Either every entry is visible afterwards,
    /// or an error is returned.
    async fn put_all(&self, partition: &str, entries: &[(CacheKey, Response)]) -> Result<()> {
        self.open(partition).await?;
        for (key, response) in entries {
            self.put(partition, key, response).await?;
        }
        Ok(())
    }

    /// Looks a key up in one partition.
    async fn lookup(&self, partition: &str, key: &CacheKey) -> Result<Option<StoredResponse>>;

    /// Lists the keys stored in a partition. Missing partitions have no keys.
    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>>;

    /// Looks a key up in every partition, in creation order.
    async fn lookup_any(&self, key: &CacheKey) -> Result<Option<StoredResponse>> {
        for name in self.names().await? {
            if let Some(found) = self.lookup(&name, key).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Counts the entries in a partition.
    async fn entry_count(&self, partition: &str) -> Result<usize> {
        Ok(self.keys(partition).await?.len())
    }

    /// Maps every partition name to its entry count.
    async fn status(&self) -> Result<BTreeMap<String, usize>> {
        let mut status = BTreeMap::new();
        for name in self.names().await? {
            let count = self.entry_count(&name).await?;
            status.insert(name, count);
        }
        Ok(status)
    }

    /// Deletes every partition.
    async fn clear(&self) -> Result<()> {
        for name in self.names().await? {
            self.delete(&name).await?;
        }
        Ok(())
    }
}
