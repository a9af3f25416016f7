use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheKey, CacheStorage, StoredResponse};
use crate::error::Result;
use crate::http::Response;

#[derive(Debug, Default)]
struct Partition {
    name: String,
    entries: HashMap<CacheKey, StoredResponse>,
}

/// In-process cache storage. Contents live as long as the value.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    partitions: RwLock<Vec<Partition>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn find<'a>(partitions: &'a [Partition], name: &str) -> Option<&'a Partition> {
    partitions.iter().find(|p| p.name == name)
}

fn find_or_create<'a>(partitions: &'a mut Vec<Partition>, name: &str) -> &'a mut Partition {
    let index = match partitions.iter().position(|p| p.name == name) {
        Some(index) => index,
        None => {
            partitions.push(Partition {
                name: name.to_string(),
                entries: HashMap::new(),
            });
            partitions.len() - 1
        }
    };
    &mut partitions[index]
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        find_or_create(&mut partitions, name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(find(&self.partitions.read().await, name).is_some())
    }

    async fn names(&self) -> Result<Vec<String>> {
        let partitions = self.partitions.read().await;
        Ok(partitions.iter().map(|p| p.name.clone()).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut partitions = self.partitions.write().await;
        let before = partitions.len();
        partitions.retain(|p| p.name != name);
        Ok(partitions.len() != before)
    }

    async fn put(&self, partition: &str, key: &CacheKey, response: &Response) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        find_or_create(&mut partitions, partition)
            .entries
            .insert(key.clone(), StoredResponse::now(response.clone()));
        Ok(())
    }

    async fn put_all(&self, partition: &str, entries: &[(CacheKey, Response)]) -> Result<()> {
        // Single write lock: readers never observe half a batch.
        let mut partitions = self.partitions.write().await;
        let target = find_or_create(&mut partitions, partition);
        for (key, response) in entries {
            target
                .entries
                .insert(key.clone(), StoredResponse::now(response.clone()));
        }
        Ok(())
    }

    async fn lookup(&self, partition: &str, key: &CacheKey) -> Result<Option<StoredResponse>> {
        let partitions = self.partitions.read().await;
        Ok(find(&partitions, partition).and_then(|p| p.entries.get(key).cloned()))
    }

    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>> {
        let partitions = self.partitions.read().await;
        Ok(find(&partitions, partition)
            .map(|p| p.entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}
