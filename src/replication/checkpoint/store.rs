//! Key-value persistence behind the checkpoint store

use crate::error::{ReplicationError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Written values replace earlier ones atomically
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// One file per key under `directory`. Each `/`-separated key segment is
/// hex encoded into one path component, so any key is a valid path. A
/// segment whose encoding would pass 200 bytes is stored as `~` and its
/// SHA-256 instead. Records below such a component start with a line holding
/// the hex encoded key so `list` can recover it. Writes go through a
/// temporary file and a rename.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    directory: PathBuf,
}

const RECORD_EXTENSION: &str = "json";

/// Longest hex encoded component kept as is, well inside the usual 255 byte
/// file name limit once the extension and temporary suffix are added
const MAX_ENCODED_SEGMENT: usize = 200;

const HASHED_MARKER: char = '~';

fn encode_segment(segment: &str) -> (String, bool) {
    let encoded = hex::encode(segment);
    if encoded.len() <= MAX_ENCODED_SEGMENT {
        (encoded, false)
    } else {
        let hash = hex::encode(Sha256::digest(segment.as_bytes()));
        (format!("{}{}", HASHED_MARKER, hash), true)
    }
}

/// Split a record written under a hashed path into its key and value
fn split_keyed(bytes: &[u8]) -> Option<(String, &[u8])> {
    let newline = bytes.iter().position(|b| *b == b'\n')?;
    let key = String::from_utf8(hex::decode(&bytes[..newline]).ok()?).ok()?;
    Some((key, &bytes[newline + 1..]))
}

impl FileKeyValueStore {
    /// Open the store, creating the directory when missing
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await.map_err(|e| {
            ReplicationError::Storage(format!(
                "cannot create checkpoint directory {}: {}",
                directory.display(),
                e
            ))
        })?;
        tracing::debug!(directory = %directory.display(), "file checkpoint store opened");
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Record path of `key`, and whether any component of it is hashed
    fn path_for(&self, key: &str) -> Result<(PathBuf, bool)> {
        let segments: Vec<&str> = key.split('/').collect();
        let invalid = || ReplicationError::Storage(format!("invalid key: {:?}", key));
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid());
        }

        let mut path = self.directory.clone();
        let mut hashed = false;
        let (last, parents) = segments.split_last().ok_or_else(invalid)?;
        for segment in parents {
            let (encoded, was_hashed) = encode_segment(segment);
            hashed |= was_hashed;
            path.push(encoded);
        }
        let (encoded, was_hashed) = encode_segment(last);
        path.push(format!("{}.{}", encoded, RECORD_EXTENSION));
        Ok((path, hashed || was_hashed))
    }

    /// Key of a record file, `None` for temporary or foreign files
    async fn key_for(&self, path: &Path) -> Result<Option<String>> {
        let Some(relative) = path.strip_prefix(&self.directory).ok() else {
            return Ok(None);
        };
        let mut segments = Vec::new();
        let mut hashed = false;
        let mut components = relative.components().peekable();
        while let Some(component) = components.next() {
            let Some(name) = component.as_os_str().to_str() else {
                return Ok(None);
            };
            let encoded = if components.peek().is_none() {
                match name.strip_suffix(&format!(".{}", RECORD_EXTENSION)) {
                    Some(encoded) => encoded,
                    None => return Ok(None),
                }
            } else {
                name
            };
            if encoded.starts_with(HASHED_MARKER) {
                hashed = true;
                continue;
            }
            match hex::decode(encoded).ok().and_then(|raw| String::from_utf8(raw).ok()) {
                Some(segment) => segments.push(segment),
                None => return Ok(None),
            }
        }
        if !hashed {
            return Ok(Some(segments.join("/")));
        }

        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(split_keyed(&bytes).map(|(key, _)| key)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", path, e)),
        }
    }
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> ReplicationError {
    ReplicationError::Storage(format!("failed to {} {}: {}", action, path.display(), err))
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (path, hashed) = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) if hashed => match split_keyed(&bytes) {
                Some((stored, value)) if stored == key => Ok(Some(value.to_vec())),
                _ => Err(ReplicationError::Storage(format!(
                    "record {} does not belong to {:?}",
                    path.display(),
                    key
                ))),
            },
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", &path, e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let (path, hashed) = self.path_for(key)?;
        let value = if hashed {
            let mut keyed = hex::encode(key).into_bytes();
            keyed.push(b'\n');
            keyed.extend_from_slice(&value);
            keyed
        } else {
            value
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("create", parent, e))?;
        }

        let mut temp = path.clone().into_os_string();
        temp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, &value)
            .await
            .map_err(|e| storage_error("write", &temp, e))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(storage_error("replace", &path, e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let (path, _) = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("delete", &path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.directory.clone()];

        while let Some(directory) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&directory).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(storage_error("list", &directory, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| storage_error("list", &directory, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| storage_error("inspect", &path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path).await? {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("a/1").await.unwrap(), None);
        store.put("a/1", b"one".to_vec()).await.unwrap();
        store.put("a/2", b"two".to_vec()).await.unwrap();
        store.put("b/1", b"other".to_vec()).await.unwrap();
        store.put("a/1", b"uno".to_vec()).await.unwrap();

        assert_eq!(store.get("a/1").await.unwrap(), Some(b"uno".to_vec()));
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/1", "a/2"]);

        store.delete("a/1").await.unwrap();
        store.delete("a/1").await.unwrap();
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/2"]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryKeyValueStore::new();
        exercise(&store).await;
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path().join("checkpoints")).await.unwrap();
        exercise(&store).await;

        let reopened = FileKeyValueStore::open(store.directory()).await.unwrap();
        assert_eq!(reopened.get("b/1").await.unwrap(), Some(b"other".to_vec()));
    }

    #[tokio::test]
    async fn test_file_store_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("zz.json"), b"x").unwrap();
        store.put("checkpoints/job/x", b"{}".to_vec()).await.unwrap();
        assert_eq!(store.list("").await.unwrap(), vec!["checkpoints/job/x"]);
    }

    #[tokio::test]
    async fn test_file_store_long_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();
        let image = format!(
            "team/{}@sha256:{}",
            "r".repeat(60),
            "ab".repeat(32)
        );
        let layer = format!("checkpoints/job/{}/layers/sha256:{}", image, "cd".repeat(32));
        let whole = format!("checkpoints/job/{}/image", image);

        store.put(&layer, b"layer".to_vec()).await.unwrap();
        store.put(&whole, b"image".to_vec()).await.unwrap();
        store.put("checkpoints/job/short/image", b"short".to_vec()).await.unwrap();

        assert_eq!(store.get(&layer).await.unwrap(), Some(b"layer".to_vec()));
        assert_eq!(store.get(&whole).await.unwrap(), Some(b"image".to_vec()));
        assert_eq!(
            store.list("checkpoints/job/").await.unwrap(),
            vec!["checkpoints/job/short/image".to_string(), whole.clone(), layer.clone()]
        );

        for entry in walk(dir.path()) {
            let name = entry.file_name().unwrap().to_str().unwrap().len();
            assert!(name < 255, "{} is {} bytes", entry.display(), name);
        }

        store.delete(&layer).await.unwrap();
        assert_eq!(store.get(&layer).await.unwrap(), None);
        assert_eq!(store.list("checkpoints/job/").await.unwrap().len(), 2);
    }

    fn walk(directory: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(directory).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                found.extend(walk(&path));
            }
            found.push(path);
        }
        found
    }
}
