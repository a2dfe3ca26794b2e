//! In-process registry backend
//!
//! Holds repositories, manifests and blobs in memory. Used for dry runs,
//! as a staging destination and by the test suite. Like a real registry it
//! verifies uploaded digests and refuses manifests whose content is missing.

use crate::digest::{Digest, DigestHasher};
use crate::error::{ReplicationError, Result};
use crate::image::{ParsedManifest, Reference, parse_manifest_with_type};
use crate::registry::endpoint::{Capabilities, RegistryEndpoint};
use crate::registry::{BlobStream, ByteStream, FetchedManifest, RegistryClient};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Chunk size used when streaming stored blobs
const STREAM_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
struct StoredManifest {
    bytes: Bytes,
    media_type: String,
}

#[derive(Debug, Default)]
struct Repository {
    tags: BTreeMap<String, Digest>,
    manifests: HashMap<Digest, StoredManifest>,
    blobs: HashMap<Digest, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    repositories: BTreeMap<String, Repository>,
    blob_uploads: Vec<(String, Digest)>,
    manifest_pushes: Vec<(String, Reference)>,
}

/// Everything observable about writes made to a [`MemoryRegistry`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteLog {
    /// `(repository, digest)` per accepted blob upload, in order
    pub blob_uploads: Vec<(String, Digest)>,
    /// `(repository, reference)` per accepted manifest push, in order
    pub manifest_pushes: Vec<(String, Reference)>,
}

pub struct MemoryRegistry {
    endpoint: RegistryEndpoint,
    capabilities: Capabilities,
    verify_uploads: bool,
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_endpoint(RegistryEndpoint::generic(host))
    }

    pub fn with_endpoint(endpoint: RegistryEndpoint) -> Self {
        Self {
            endpoint,
            capabilities: Capabilities {
                catalog: true,
                bulk_blob_check: true,
                ordered_layer_upload: false,
            },
            verify_uploads: true,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Accept uploads without checking their digest, as a misbehaving
    /// registry would
    pub fn with_upload_verification(mut self, verify: bool) -> Self {
        self.verify_uploads = verify;
        self
    }

    /// Store a blob directly, bypassing the write log
    pub fn insert_blob(&self, repository: &str, data: impl Into<Bytes>) -> Digest {
        let data = data.into();
        let digest = Digest::compute(&data);
        self.state
            .lock()
            .repositories
            .entry(repository.to_string())
            .or_default()
            .blobs
            .insert(digest.clone(), data);
        digest
    }

    /// Store a manifest directly, optionally tagging it, bypassing the
    /// write log and content checks
    pub fn insert_manifest(
        &self,
        repository: &str,
        tag: Option<&str>,
        bytes: impl Into<Bytes>,
        media_type: &str,
    ) -> Digest {
        let bytes = bytes.into();
        let digest = Digest::compute(&bytes);
        let mut state = self.state.lock();
        let repo = state.repositories.entry(repository.to_string()).or_default();
        repo.manifests.insert(
            digest.clone(),
            StoredManifest {
                bytes,
                media_type: media_type.to_string(),
            },
        );
        if let Some(tag) = tag {
            repo.tags.insert(tag.to_string(), digest.clone());
        }
        digest
    }

    pub fn has_blob(&self, repository: &str, digest: &Digest) -> bool {
        self.state
            .lock()
            .repositories
            .get(repository)
            .is_some_and(|repo| repo.blobs.contains_key(digest))
    }

    pub fn has_manifest(&self, repository: &str, digest: &Digest) -> bool {
        self.state
            .lock()
            .repositories
            .get(repository)
            .is_some_and(|repo| repo.manifests.contains_key(digest))
    }

    pub fn tag_digest(&self, repository: &str, tag: &str) -> Option<Digest> {
        self.state
            .lock()
            .repositories
            .get(repository)
            .and_then(|repo| repo.tags.get(tag).cloned())
    }

    pub fn write_log(&self) -> WriteLog {
        let state = self.state.lock();
        WriteLog {
            blob_uploads: state.blob_uploads.clone(),
            manifest_pushes: state.manifest_pushes.clone(),
        }
    }

    fn resolve(repo: &Repository, reference: &Reference) -> Option<Digest> {
        match reference {
            Reference::Tag(tag) => repo.tags.get(tag).cloned(),
            Reference::Digest(digest) => repo.manifests.contains_key(digest).then(|| digest.clone()),
        }
    }

    /// Reject manifests that reference content this repository lacks
    fn check_references(repo: &Repository, repository: &str, bytes: &[u8], media_type: &str) -> Result<()> {
        let Ok((_, parsed)) = parse_manifest_with_type(bytes, Some(media_type)) else {
            return Ok(());
        };

        match parsed {
            ParsedManifest::Image(manifest) => {
                if let Some(missing) = manifest
                    .blobs()
                    .into_iter()
                    .find(|blob| !repo.blobs.contains_key(&blob.digest))
                {
                    return Err(ReplicationError::Registry {
                        status: 400,
                        message: format!(
                            "MANIFEST_BLOB_UNKNOWN: {} references missing blob {}",
                            repository, missing.digest
                        ),
                    });
                }
            }
            ParsedManifest::List(list) => {
                if let Some(missing) = list
                    .manifests
                    .iter()
                    .find(|child| !repo.manifests.contains_key(&child.digest))
                {
                    return Err(ReplicationError::Registry {
                        status: 400,
                        message: format!(
                            "MANIFEST_UNKNOWN: {} references missing manifest {}",
                            repository, missing.digest
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    fn endpoint(&self) -> &RegistryEndpoint {
        &self.endpoint
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .repositories
            .iter()
            .filter(|(_, repo)| !repo.manifests.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.state
            .lock()
            .repositories
            .get(repository)
            .map(|repo| repo.tags.keys().cloned().collect())
            .ok_or_else(|| ReplicationError::NotFound(format!("repository {}", repository)))
    }

    async fn get_manifest(&self, repository: &str, reference: &Reference) -> Result<FetchedManifest> {
        let state = self.state.lock();
        let not_found = || ReplicationError::NotFound(format!("manifest {}:{}", repository, reference));
        let repo = state.repositories.get(repository).ok_or_else(not_found)?;
        let digest = Self::resolve(repo, reference).ok_or_else(not_found)?;
        let stored = repo.manifests.get(&digest).ok_or_else(not_found)?;

        Ok(FetchedManifest {
            bytes: stored.bytes.clone(),
            media_type: stored.media_type.clone(),
            digest,
        })
    }

    async fn manifest_digest(
        &self,
        repository: &str,
        reference: &Reference,
    ) -> Result<Option<Digest>> {
        Ok(self
            .state
            .lock()
            .repositories
            .get(repository)
            .and_then(|repo| Self::resolve(repo, reference)))
    }

    async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        Ok(self.has_blob(repository, digest))
    }

    async fn blobs_exist(
        &self,
        repository: &str,
        digests: &[Digest],
    ) -> HashMap<Digest, Result<bool>> {
        if !self.capabilities.bulk_blob_check {
            let mut results = HashMap::with_capacity(digests.len());
            for digest in digests {
                results.insert(digest.clone(), self.blob_exists(repository, digest).await);
            }
            return results;
        }

        let state = self.state.lock();
        let repo = state.repositories.get(repository);
        digests
            .iter()
            .map(|digest| {
                let exists = repo.is_some_and(|repo| repo.blobs.contains_key(digest));
                (digest.clone(), Ok(exists))
            })
            .collect()
    }

    async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<BlobStream> {
        let data = self
            .state
            .lock()
            .repositories
            .get(repository)
            .and_then(|repo| repo.blobs.get(digest).cloned())
            .ok_or_else(|| ReplicationError::NotFound(format!("blob {}@{}", repository, digest)))?;

        let size = data.len() as u64;
        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(STREAM_CHUNK)
            .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK).min(data.len()))))
            .collect();

        Ok(BlobStream {
            size,
            stream: futures::stream::iter(chunks).boxed(),
        })
    }

    async fn put_blob(
        &self,
        repository: &str,
        digest: &Digest,
        _size: u64,
        mut stream: ByteStream,
    ) -> Result<()> {
        let mut hasher = DigestHasher::new();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            body.extend_from_slice(&chunk);
        }

        if self.verify_uploads {
            hasher.verify(digest)?;
        }

        let mut state = self.state.lock();
        state
            .repositories
            .entry(repository.to_string())
            .or_default()
            .blobs
            .insert(digest.clone(), Bytes::from(body));
        state
            .blob_uploads
            .push((repository.to_string(), digest.clone()));
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &Reference,
        bytes: Bytes,
        media_type: &str,
    ) -> Result<Digest> {
        let digest = Digest::compute(&bytes);
        if let Reference::Digest(expected) = reference {
            if expected != &digest {
                return Err(ReplicationError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        let mut state = self.state.lock();
        let repo = state.repositories.entry(repository.to_string()).or_default();
        Self::check_references(repo, repository, &bytes, media_type)?;

        repo.manifests.insert(
            digest.clone(),
            StoredManifest {
                bytes,
                media_type: media_type.to_string(),
            },
        );
        if let Reference::Tag(tag) = reference {
            repo.tags.insert(tag.clone(), digest.clone());
        }
        state
            .manifest_pushes
            .push((repository.to_string(), reference.clone()));
        Ok(digest)
    }

    async fn delete_image(&self, repository: &str, reference: &Reference) -> Result<()> {
        let mut state = self.state.lock();
        let not_found = || ReplicationError::NotFound(format!("manifest {}:{}", repository, reference));
        let repo = state.repositories.get_mut(repository).ok_or_else(not_found)?;
        let digest = Self::resolve(repo, reference).ok_or_else(not_found)?;

        repo.manifests.remove(&digest);
        repo.tags.retain(|_, tagged| tagged != &digest);
        Ok(())
    }

    async fn delete_blob(&self, repository: &str, digest: &Digest) -> Result<()> {
        if let Some(repo) = self.state.lock().repositories.get_mut(repository) {
            repo.blobs.remove(digest);
        }
        Ok(())
    }
}
