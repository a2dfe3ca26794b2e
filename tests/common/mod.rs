//! Shared fixtures for the integration tests

#![allow(dead_code)]

pub mod http;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use registry_replicator::concurrency::Backoff;
use registry_replicator::config::ReplicatorConfig;
use registry_replicator::digest::Digest;
use registry_replicator::error::{ReplicationError, Result};
use registry_replicator::image::manifest::{DOCKER_MANIFEST_V2, OCI_INDEX};
use registry_replicator::image::{
    ImageManifest, LayerDescriptor, ManifestDescriptor, ManifestList, Platform, Reference,
};
use registry_replicator::registry::{
    BlobStream, ByteStream, Capabilities, FetchedManifest, MemoryRegistry, RegistryClient,
    RegistryEndpoint,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Digests of an image stored by [`push_image`]
#[derive(Debug, Clone)]
pub struct PushedImage {
    pub manifest: Digest,
    pub manifest_size: u64,
    pub config: Digest,
    pub layers: Vec<Digest>,
}

impl PushedImage {
    /// Config and layers, in manifest order
    pub fn blobs(&self) -> Vec<Digest> {
        std::iter::once(self.config.clone())
            .chain(self.layers.iter().cloned())
            .collect()
    }
}

pub fn fast_backoff(max_attempts: u32) -> Backoff {
    Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(5), max_attempts)
}

pub fn test_config() -> ReplicatorConfig {
    let mut config = ReplicatorConfig::default();
    config.workers = 4;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

pub fn memory_registry(host: &str) -> Arc<MemoryRegistry> {
    Arc::new(MemoryRegistry::new(host))
}

pub fn push_image(registry: &MemoryRegistry, repository: &str, tag: Option<&str>, layers: &[&[u8]]) -> PushedImage {
    push_platform_image(registry, repository, tag, "amd64", layers)
}

/// Store the blobs and the Docker v2 manifest of a single platform image
pub fn push_platform_image(
    registry: &MemoryRegistry,
    repository: &str,
    tag: Option<&str>,
    architecture: &str,
    layers: &[&[u8]],
) -> PushedImage {
    let config_bytes = serde_json::to_vec(&serde_json::json!({
        "architecture": architecture,
        "os": "linux",
        "rootfs": { "type": "layers", "diff_ids": layers.len() },
    }))
    .unwrap();
    let config_size = config_bytes.len() as u64;
    let config = registry.insert_blob(repository, config_bytes);

    let descriptors: Vec<LayerDescriptor> = layers
        .iter()
        .map(|data| LayerDescriptor {
            media_type: LAYER_MEDIA_TYPE.to_string(),
            size: data.len() as u64,
            digest: registry.insert_blob(repository, Bytes::copy_from_slice(data)),
        })
        .collect();

    let manifest = ImageManifest {
        schema_version: 2,
        media_type: Some(DOCKER_MANIFEST_V2.to_string()),
        config: LayerDescriptor {
            media_type: CONFIG_MEDIA_TYPE.to_string(),
            size: config_size,
            digest: config.clone(),
        },
        layers: descriptors.clone(),
    };
    let bytes = manifest.to_bytes().unwrap();
    let manifest_size = bytes.len() as u64;
    let manifest = registry.insert_manifest(repository, tag, bytes, DOCKER_MANIFEST_V2);

    PushedImage {
        manifest,
        manifest_size,
        config,
        layers: descriptors.into_iter().map(|d| d.digest).collect(),
    }
}

/// Whole body of a stored blob
pub async fn read_blob(registry: &dyn RegistryClient, repository: &str, digest: &Digest) -> Vec<u8> {
    let mut blob = registry.get_blob(repository, digest).await.unwrap();
    let mut data = Vec::new();
    while let Some(chunk) = blob.stream.next().await {
        data.extend_from_slice(&chunk.unwrap());
    }
    data
}

pub fn platform(architecture: &str) -> Platform {
    Platform {
        architecture: architecture.to_string(),
        os: "linux".to_string(),
        variant: None,
        os_version: None,
    }
}

/// Store an OCI index over images already pushed to `repository`
pub fn push_index(
    registry: &MemoryRegistry,
    repository: &str,
    tag: Option<&str>,
    children: &[(&PushedImage, Platform)],
) -> Digest {
    let list = ManifestList {
        schema_version: 2,
        media_type: Some(OCI_INDEX.to_string()),
        manifests: children
            .iter()
            .map(|(image, platform)| ManifestDescriptor {
                media_type: DOCKER_MANIFEST_V2.to_string(),
                size: image.manifest_size,
                digest: image.manifest.clone(),
                platform: Some(platform.clone()),
            })
            .collect(),
    };
    registry.insert_manifest(repository, tag, list.to_bytes().unwrap(), OCI_INDEX)
}

/// Faults a [`FaultyRegistry`] injects
#[derive(Debug, Default)]
pub struct Faults {
    /// Remaining network failures per uploaded digest
    pub put_blob_failures: HashMap<Digest, u32>,
    /// Blobs served with their first byte flipped
    pub corrupt_blobs: HashSet<Digest>,
    /// Manifests whose push by digest fails with a server error
    pub failing_manifests: HashSet<Digest>,
    /// Every existence check errors
    pub existence_errors: bool,
    /// Every call is rejected as a fatal authentication failure
    pub auth_fatal: bool,
    /// Uploads wait this long before reaching the backend
    pub upload_delay: Option<Duration>,
    /// Blob deletes are refused
    pub failing_blob_deletes: bool,
}

/// A [`MemoryRegistry`] wrapped with injectable faults and call counters
pub struct FaultyRegistry {
    inner: Arc<MemoryRegistry>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FaultyRegistry {
    pub fn new(inner: Arc<MemoryRegistry>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryRegistry> {
        &self.inner
    }

    pub fn faults(&self) -> parking_lot::MutexGuard<'_, Faults> {
        self.faults.lock()
    }

    pub fn fail_uploads(&self, digest: &Digest, times: u32) {
        self.faults.lock().put_blob_failures.insert(digest.clone(), times);
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        *self.calls.lock().entry(operation).or_default() += 1;
        if self.faults.lock().auth_fatal {
            return Err(ReplicationError::auth_fatal(
                self.inner.endpoint().key(),
                "denied: requested access to the resource is denied",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for FaultyRegistry {
    fn endpoint(&self) -> &RegistryEndpoint {
        self.inner.endpoint()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        self.record("list_repositories")?;
        self.inner.list_repositories().await
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.record("list_tags")?;
        self.inner.list_tags(repository).await
    }

    async fn get_manifest(&self, repository: &str, reference: &Reference) -> Result<FetchedManifest> {
        self.record("get_manifest")?;
        self.inner.get_manifest(repository, reference).await
    }

    async fn manifest_digest(&self, repository: &str, reference: &Reference) -> Result<Option<Digest>> {
        self.record("manifest_digest")?;
        self.inner.manifest_digest(repository, reference).await
    }

    async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        self.record("blob_exists")?;
        if self.faults.lock().existence_errors {
            return Err(ReplicationError::Network("existence check timed out".to_string()));
        }
        self.inner.blob_exists(repository, digest).await
    }

    async fn blobs_exist(&self, repository: &str, digests: &[Digest]) -> HashMap<Digest, Result<bool>> {
        if let Err(e) = self.record("blobs_exist") {
            return digests.iter().map(|d| (d.clone(), Err(e.clone()))).collect();
        }
        if self.faults.lock().existence_errors {
            return digests
                .iter()
                .map(|d| (d.clone(), Err(ReplicationError::Network("bulk check failed".to_string()))))
                .collect();
        }
        self.inner.blobs_exist(repository, digests).await
    }

    async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<BlobStream> {
        self.record("get_blob")?;
        let blob = self.inner.get_blob(repository, digest).await?;
        if !self.faults.lock().corrupt_blobs.contains(digest) {
            return Ok(blob);
        }

        let stream = blob
            .stream
            .map(|chunk| {
                chunk.map(|bytes| {
                    let mut data = bytes.to_vec();
                    if let Some(first) = data.first_mut() {
                        *first ^= 0xff;
                    }
                    Bytes::from(data)
                })
            })
            .boxed();
        Ok(BlobStream { size: blob.size, stream })
    }

    async fn put_blob(&self, repository: &str, digest: &Digest, size: u64, stream: ByteStream) -> Result<()> {
        self.record("put_blob")?;
        let delay = {
            let mut faults = self.faults.lock();
            if let Some(remaining) = faults.put_blob_failures.get_mut(digest) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ReplicationError::Network("connection reset by peer".to_string()));
                }
            }
            faults.upload_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.put_blob(repository, digest, size, stream).await
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &Reference,
        bytes: Bytes,
        media_type: &str,
    ) -> Result<Digest> {
        self.record("put_manifest")?;
        if let Reference::Digest(digest) = reference {
            if self.faults.lock().failing_manifests.contains(digest) {
                return Err(ReplicationError::Registry {
                    status: 500,
                    message: format!("manifest {} rejected", digest),
                });
            }
        }
        self.inner.put_manifest(repository, reference, bytes, media_type).await
    }

    async fn delete_image(&self, repository: &str, reference: &Reference) -> Result<()> {
        self.record("delete_image")?;
        self.inner.delete_image(repository, reference).await
    }

    async fn delete_blob(&self, repository: &str, digest: &Digest) -> Result<()> {
        self.record("delete_blob")?;
        if self.faults.lock().failing_blob_deletes {
            return Err(ReplicationError::Registry {
                status: 405,
                message: "blob deletion is disabled".to_string(),
            });
        }
        self.inner.delete_blob(repository, digest).await
    }
}
