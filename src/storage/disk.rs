use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CacheKey, CacheStorage, StoredResponse};
use crate::error::{Error, Result};
use crate::http::{Response, ResponseKind};

const MANIFEST_FILE: &str = "partitions.toml";

/// Ordered list of partition names, persisted next to the partition directories.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    partitions: Vec<String>,
}

/// On-disk form of one cached response.
#[derive(Debug, Serialize, Deserialize)]
struct EntryFile {
    key: String,
    status: u16,
    kind: ResponseKind,
    cached_at: DateTime<Utc>,
    headers: Vec<(String, String)>,
    /// Base64-encoded body.
    body: String,
}

impl EntryFile {
    fn new(key: &CacheKey, response: &Response) -> Self {
        Self {
            key: key.as_str().to_string(),
            status: response.status,
            kind: response.kind,
            cached_at: Utc::now(),
            headers: response.headers.clone(),
            body: BASE64.encode(&response.body),
        }
    }

    fn into_stored(self) -> Result<StoredResponse> {
        let body = BASE64
            .decode(self.body.as_bytes())
            .map_err(|e| Error::Storage(format!("corrupt body for {}: {e}", self.key)))?;
        Ok(StoredResponse {
            response: Response {
                status: self.status,
                headers: self.headers,
                body: body.into(),
                kind: self.kind,
            },
            cached_at: self.cached_at,
        })
    }
}

/// Hex-encoded SHA-256 of `input`, used for file and directory names.
fn digest_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Sibling temp path unique to one write. Concurrent writers of the same
/// file each rename their own temp file; the last rename wins.
fn temp_path(path: &Path) -> PathBuf {
    path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()))
}

/// Writes `contents` to a sibling temp file, then renames it into place.
async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp_path = temp_path(path);
    if let Err(e) = tokio::fs::write(&tmp_path, contents).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    tokio::fs::rename(&tmp_path, path).await
}

fn to_toml<T: Serialize>(value: &T) -> Result<String> {
    toml::to_string(value).map_err(|e| Error::Storage(e.to_string()))
}

/// Persistent cache storage rooted at a directory.
///
/// Layout: `partitions.toml` lists partition names in creation order, each
/// partition is a directory named by the hash of its name, and each entry is
/// a TOML file named by the hash of its key. Every file is written through a
/// temp file and a rename, so readers see either the old or the new entry.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
    manifest_lock: Mutex<()>,
}

impl DiskStorage {
    /// Opens (creating if needed) a storage rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub async fn open_at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            manifest_lock: Mutex::new(()),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("p-{}", &digest_hex(name)[..32]))
    }

    fn entry_path(&self, partition: &str, key: &CacheKey) -> PathBuf {
        self.partition_dir(partition)
            .join(format!("{}.toml", digest_hex(key.as_str())))
    }

    async fn read_manifest(&self) -> Result<Manifest> {
        match tokio::fs::read_to_string(self.root.join(MANIFEST_FILE)).await {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| Error::Storage(format!("corrupt partition manifest: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        write_atomic(&self.root.join(MANIFEST_FILE), &to_toml(manifest)?).await?;
        Ok(())
    }

    async fn ensure_partition(&self, name: &str) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.read_manifest().await?;
        tokio::fs::create_dir_all(self.partition_dir(name)).await?;
        if !manifest.partitions.iter().any(|p| p == name) {
            manifest.partitions.push(name.to_string());
            self.write_manifest(&manifest).await?;
        }
        Ok(())
    }

    async fn read_entry(path: &Path) -> Result<Option<EntryFile>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => toml::from_str(&contents)
                .map(Some)
                .map_err(|e| Error::Storage(format!("corrupt entry {}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, name: &str) -> Result<()> {
        self.ensure_partition(name).await
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.read_manifest().await?.partitions.iter().any(|p| p == name))
    }

    async fn names(&self) -> Result<Vec<String>> {
        Ok(self.read_manifest().await?.partitions)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.read_manifest().await?;
        let before = manifest.partitions.len();
        manifest.partitions.retain(|p| p != name);
        if manifest.partitions.len() == before {
            return Ok(false);
        }
        self.write_manifest(&manifest).await?;
        match tokio::fs::remove_dir_all(self.partition_dir(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, partition: &str, key: &CacheKey, response: &Response) -> Result<()> {
        self.ensure_partition(partition).await?;
        let contents = to_toml(&EntryFile::new(key, response))?;
        write_atomic(&self.entry_path(partition, key), &contents).await?;
        Ok(())
    }

    async fn put_all(&self, partition: &str, entries: &[(CacheKey, Response)]) -> Result<()> {
        self.ensure_partition(partition).await?;

        // Stage every entry before making any of them visible.
        let mut staged = Vec::with_capacity(entries.len());
        for (key, response) in entries {
            let path = self.entry_path(partition, key);
            let tmp_path = temp_path(&path);
            let written = match to_toml(&EntryFile::new(key, response)) {
                Ok(contents) => tokio::fs::write(&tmp_path, contents).await.map_err(Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                for (tmp, _) in &staged {
                    let _ = tokio::fs::remove_file(tmp).await;
                }
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e);
            }
            staged.push((tmp_path, path));
        }

        for (tmp, path) in staged {
            tokio::fs::rename(&tmp, &path).await?;
        }
        Ok(())
    }

    async fn lookup(&self, partition: &str, key: &CacheKey) -> Result<Option<StoredResponse>> {
        if !self.has(partition).await? {
            return Ok(None);
        }
        match Self::read_entry(&self.entry_path(partition, key)).await? {
            Some(entry) => entry.into_stored().map(Some),
            None => Ok(None),
        }
    }

    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>> {
        if !self.has(partition).await? {
            return Ok(Vec::new());
        }
        let mut dir = match tokio::fs::read_dir(self.partition_dir(partition)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_none_or(|ext| ext != "toml") {
                continue;
            }
            if let Some(entry) = Self::read_entry(&path).await? {
                keys.push(CacheKey(entry.key));
            }
        }
        Ok(keys)
    }
}
