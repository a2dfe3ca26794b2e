//! Registry access: the [`RegistryClient`] capability trait and its backends
//!
//! - [`client::OciClient`] speaks the distribution API v2 over HTTP
//! - [`memory::MemoryRegistry`] keeps everything in process
//!
//! Authentication is handled by the [`token_manager::AuthProvider`], which
//! caches per-endpoint credentials produced by the issuers in [`auth`].

pub mod auth;
pub mod client;
pub mod endpoint;
pub mod memory;
pub mod operations;
pub mod token_manager;
pub mod transport;

pub use auth::{Credential, CredentialSecret, TokenIssuer};
pub use client::{OciClient, OciClientBuilder};
pub use endpoint::{BackendKind, Capabilities, RegistryEndpoint};
pub use memory::MemoryRegistry;
pub use token_manager::AuthProvider;

use crate::digest::Digest;
use crate::error::Result;
use crate::image::Reference;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// Concurrent HEAD requests used by the default [`RegistryClient::blobs_exist`]
pub const DEFAULT_EXISTENCE_CHECK_CONCURRENCY: usize = 8;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A blob body being streamed from a registry
pub struct BlobStream {
    /// Size in bytes as announced by the registry
    pub size: u64,
    pub stream: ByteStream,
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream").field("size", &self.size).finish()
    }
}

/// A manifest as served by a registry
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedManifest {
    pub bytes: Bytes,
    pub media_type: String,
    /// Digest of `bytes`
    pub digest: Digest,
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    fn endpoint(&self) -> &RegistryEndpoint;

    fn capabilities(&self) -> Capabilities {
        self.endpoint().capabilities()
    }

    fn existence_check_concurrency(&self) -> usize {
        DEFAULT_EXISTENCE_CHECK_CONCURRENCY
    }

    /// Repository names relative to the endpoint namespace
    async fn list_repositories(&self) -> Result<Vec<String>>;

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    async fn get_manifest(&self, repository: &str, reference: &Reference) -> Result<FetchedManifest>;

    /// Digest `reference` currently resolves to, `None` when absent
    async fn manifest_digest(&self, repository: &str, reference: &Reference)
    -> Result<Option<Digest>>;

    async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool>;

    /// Existence of many blobs. Each digest gets its own result so one
    /// failed check does not hide the others. Backends with
    /// `bulk_blob_check` override this; the default issues bounded
    /// concurrent [`blob_exists`](Self::blob_exists) calls.
    async fn blobs_exist(
        &self,
        repository: &str,
        digests: &[Digest],
    ) -> HashMap<Digest, Result<bool>> {
        let limit = self.existence_check_concurrency().max(1);
        futures::stream::iter(digests.iter().cloned())
            .map(|digest| async move {
                let exists = self.blob_exists(repository, &digest).await;
                (digest, exists)
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<BlobStream>;

    /// Upload a blob from a stream. Returns once the registry has
    /// acknowledged the complete upload.
    async fn put_blob(
        &self,
        repository: &str,
        digest: &Digest,
        size: u64,
        stream: ByteStream,
    ) -> Result<()>;

    /// Store manifest bytes unchanged and return their digest
    async fn put_manifest(
        &self,
        repository: &str,
        reference: &Reference,
        bytes: Bytes,
        media_type: &str,
    ) -> Result<Digest>;

    async fn delete_image(&self, repository: &str, reference: &Reference) -> Result<()>;

    /// Remove a stored blob, e.g. one that failed verification after upload
    async fn delete_blob(&self, repository: &str, digest: &Digest) -> Result<()>;
}
