//! Manifest operations for registry client
//!
//! Implements Docker Registry v2 and OCI manifest operations:
//! - Manifest download (GET /v2/{name}/manifests/{reference})
//! - Digest resolution (HEAD /v2/{name}/manifests/{reference})
//! - Manifest upload (PUT /v2/{name}/manifests/{reference})
//! - Manifest deletion (DELETE /v2/{name}/manifests/{digest})

use crate::digest::Digest;
use crate::error::{ReplicationError, Result};
use crate::image::Reference;
use crate::image::manifest::ACCEPTED_MANIFEST_TYPES;
use crate::registry::FetchedManifest;
use crate::registry::transport::{RegistryTransport, repository_scope};
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

#[derive(Clone)]
pub struct ManifestOperations {
    transport: Arc<RegistryTransport>,
}

impl ManifestOperations {
    pub fn new(transport: Arc<RegistryTransport>) -> Self {
        Self { transport }
    }

    fn manifest_path(path: &str, reference: &Reference) -> String {
        format!("v2/{}/manifests/{}", path, reference)
    }

    pub async fn get_manifest(&self, path: &str, reference: &Reference) -> Result<FetchedManifest> {
        let url = self.transport.url(&Self::manifest_path(path, reference))?;
        let scope = repository_scope(path, "pull");
        let timeout = self.transport.request_timeout();
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");

        let response = self
            .transport
            .send(Some(&scope), "manifest fetch", |http| {
                http.get(url.clone()).header(ACCEPT, &accept).timeout(timeout)
            })
            .await?;

        if !response.status().is_success() {
            return Err(self.transport.error_for(response, "manifest fetch").await);
        }

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_default();
        let bytes = response.bytes().await?;
        let digest = Digest::compute(&bytes);

        if let Reference::Digest(expected) = reference {
            if &digest != expected {
                return Err(ReplicationError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        tracing::trace!(repository = path, %reference, %digest, media_type = %media_type, "fetched manifest");
        Ok(FetchedManifest {
            bytes,
            media_type,
            digest,
        })
    }

    /// Digest a reference resolves to without downloading the document when
    /// the registry reports `Docker-Content-Digest`
    pub async fn manifest_digest(&self, path: &str, reference: &Reference) -> Result<Option<Digest>> {
        let url = self.transport.url(&Self::manifest_path(path, reference))?;
        let scope = repository_scope(path, "pull");
        let timeout = self.transport.request_timeout();
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");

        let response = self
            .transport
            .send(Some(&scope), "manifest head", |http| {
                http.head(url.clone()).header(ACCEPT, &accept).timeout(timeout)
            })
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let reported = response
                    .headers()
                    .get(DOCKER_CONTENT_DIGEST)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<Digest>().ok());
                match reported {
                    Some(digest) => Ok(Some(digest)),
                    None => match self.get_manifest(path, reference).await {
                        Ok(manifest) => Ok(Some(manifest.digest)),
                        Err(ReplicationError::NotFound(_)) => Ok(None),
                        Err(err) => Err(err),
                    },
                }
            }
            _ => Err(self.transport.error_for(response, "manifest head").await),
        }
    }

    /// Upload manifest bytes unchanged with their media type
    pub async fn put_manifest(
        &self,
        path: &str,
        reference: &Reference,
        bytes: Bytes,
        media_type: &str,
    ) -> Result<Digest> {
        let url = self.transport.url(&Self::manifest_path(path, reference))?;
        let scope = repository_scope(path, "pull,push");
        let timeout = self.transport.request_timeout();
        let digest = Digest::compute(&bytes);

        let response = self
            .transport
            .send(Some(&scope), "manifest upload", |http| {
                http.put(url.clone())
                    .header(CONTENT_TYPE, media_type)
                    .body(bytes.clone())
                    .timeout(timeout)
            })
            .await?;

        if !response.status().is_success() {
            return Err(self.transport.error_for(response, "manifest upload").await);
        }

        tracing::debug!(repository = path, %reference, %digest, "manifest uploaded");
        Ok(digest)
    }

    /// Delete the manifest `reference` points at. Tags are resolved first
    /// because registries only delete by digest.
    pub async fn delete_manifest(&self, path: &str, reference: &Reference) -> Result<()> {
        let digest = match reference {
            Reference::Digest(digest) => digest.clone(),
            Reference::Tag(tag) => self
                .manifest_digest(path, reference)
                .await?
                .ok_or_else(|| ReplicationError::NotFound(format!("{}:{}", path, tag)))?,
        };

        let url = self
            .transport
            .url(&Self::manifest_path(path, &Reference::Digest(digest)))?;
        let scope = repository_scope(path, "delete");
        let timeout = self.transport.request_timeout();

        let response = self
            .transport
            .send(Some(&scope), "manifest delete", |http| {
                http.delete(url.clone()).timeout(timeout)
            })
            .await?;

        if !response.status().is_success() {
            return Err(self.transport.error_for(response, "manifest delete").await);
        }
        Ok(())
    }
}
