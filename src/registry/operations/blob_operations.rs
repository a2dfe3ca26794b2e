//! Blob operations for registry client
//!
//! Implements Docker Registry v2 blob operations:
//! - Blob existence checks (HEAD /v2/{name}/blobs/{digest})
//! - Blob download as a byte stream (GET /v2/{name}/blobs/{digest})
//! - Streamed monolithic upload (POST then PUT /v2/{name}/blobs/uploads/)
//! - Blob removal (DELETE /v2/{name}/blobs/{digest})

use crate::digest::Digest;
use crate::error::handlers::NetworkErrorHandler;
use crate::error::{ReplicationError, Result};
use crate::registry::transport::{RegistryTransport, repository_scope};
use crate::registry::{BlobStream, ByteStream};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use std::sync::Arc;

#[derive(Clone)]
pub struct BlobOperations {
    transport: Arc<RegistryTransport>,
}

impl BlobOperations {
    pub fn new(transport: Arc<RegistryTransport>) -> Self {
        Self { transport }
    }

    /// Check if blob exists using Docker Registry v2 HEAD request
    pub async fn blob_exists(&self, path: &str, digest: &Digest) -> Result<bool> {
        let url = self.transport.url(&format!("v2/{}/blobs/{}", path, digest))?;
        let scope = repository_scope(path, "pull");
        let timeout = self.transport.request_timeout();

        let response = self
            .transport
            .send(Some(&scope), "blob existence check", |http| {
                http.head(url.clone()).timeout(timeout)
            })
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.transport.error_for(response, "blob existence check").await),
        }
    }

    /// Open a blob for streaming; the body is never buffered whole
    pub async fn get_blob(&self, path: &str, digest: &Digest) -> Result<BlobStream> {
        let url = self.transport.url(&format!("v2/{}/blobs/{}", path, digest))?;
        let scope = repository_scope(path, "pull");

        let response = self
            .transport
            .send(Some(&scope), "blob download", |http| http.get(url.clone()))
            .await?;

        if !response.status().is_success() {
            return Err(self.transport.error_for(response, "blob download").await);
        }

        let size = response.content_length().unwrap_or(0);
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| NetworkErrorHandler::handle_network_error(&e, "blob download")))
            .boxed();

        Ok(BlobStream { size, stream })
    }

    /// Upload a blob with the staged upload pattern: open a session, then
    /// stream the whole body in a single PUT carrying the digest.
    pub async fn put_blob(
        &self,
        path: &str,
        digest: &Digest,
        size: u64,
        stream: ByteStream,
    ) -> Result<()> {
        let scope = repository_scope(path, "pull,push");
        let start = self.transport.url(&format!("v2/{}/blobs/uploads/", path))?;
        let timeout = self.transport.request_timeout();

        let response = self
            .transport
            .send(Some(&scope), "blob upload session", |http| {
                http.post(start.clone())
                    .header(CONTENT_LENGTH, "0")
                    .timeout(timeout)
            })
            .await?;

        if !response.status().is_success() {
            return Err(self.transport.error_for(response, "blob upload session").await);
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ReplicationError::Registry {
                status: response.status().as_u16(),
                message: "upload session response has no Location header".to_string(),
            })?;

        let mut upload_url = self.transport.resolve(location)?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", digest.as_str());

        tracing::trace!(repository = path, digest = %digest, %upload_url, "upload session opened");

        let mut request = self
            .transport
            .http()
            .put(upload_url)
            .header(CONTENT_TYPE, "application/octet-stream");
        // Unknown size goes out chunked
        if size > 0 {
            request = request.header(CONTENT_LENGTH, size);
        }
        let request = request.body(reqwest::Body::wrap_stream(stream));

        let response = self
            .transport
            .send_once(Some(&scope), "blob upload", request)
            .await?;

        if !response.status().is_success() {
            return Err(self.transport.error_for(response, "blob upload").await);
        }

        tracing::debug!(repository = path, digest = %digest, size, "blob uploaded");
        Ok(())
    }

    /// Delete a blob. A blob that is already gone counts as deleted.
    pub async fn delete_blob(&self, path: &str, digest: &Digest) -> Result<()> {
        let url = self.transport.url(&format!("v2/{}/blobs/{}", path, digest))?;
        let scope = repository_scope(path, "delete");
        let timeout = self.transport.request_timeout();

        let response = self
            .transport
            .send(Some(&scope), "blob delete", |http| {
                http.delete(url.clone()).timeout(timeout)
            })
            .await?;

        match response.status() {
            status if status.is_success() || status == StatusCode::NOT_FOUND => {
                tracing::debug!(repository = path, digest = %digest, "blob deleted");
                Ok(())
            }
            _ => Err(self.transport.error_for(response, "blob delete").await),
        }
    }
}
