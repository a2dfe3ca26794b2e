//! Blob copier: stream one blob from source to destination
//!
//! Bytes are hashed while they flow to the destination. The digest is
//! checked once the destination acknowledges the upload, and only a
//! verified blob is checkpointed.

use crate::concurrency::{Backoff, retry_with_backoff};
use crate::digest::{Digest, DigestHasher};
use crate::error::{ReplicationError, Result};
use crate::image::LayerDescriptor;
use crate::registry::{ByteStream, RegistryClient};
use crate::replication::checkpoint::CheckpointStore;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Copy of one blob within an image
#[derive(Debug, Clone)]
pub struct CopyTask {
    pub job_id: String,
    /// Checkpoint key of the image the blob belongs to
    pub image: String,
    pub source_repository: String,
    pub destination_repository: String,
    pub layer: LayerDescriptor,
    pub attempts: u32,
    pub status: TaskStatus,
}

impl CopyTask {
    pub fn new(
        job_id: impl Into<String>,
        image: impl Into<String>,
        source_repository: impl Into<String>,
        destination_repository: impl Into<String>,
        layer: LayerDescriptor,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            image: image.into(),
            source_repository: source_repository.into(),
            destination_repository: destination_repository.into(),
            layer,
            attempts: 0,
            status: TaskStatus::Pending,
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.layer.digest
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub digest: Digest,
    pub bytes_transferred: u64,
    pub attempts: u32,
}

/// Passes chunks through while feeding them to a shared hasher
fn hashing_stream(stream: ByteStream, hasher: Arc<Mutex<DigestHasher>>) -> ByteStream {
    stream
        .map(move |chunk| {
            if let Ok(bytes) = &chunk {
                hasher.lock().update(bytes);
            }
            chunk
        })
        .boxed()
}

pub struct Copier {
    source: Arc<dyn RegistryClient>,
    destination: Arc<dyn RegistryClient>,
    checkpoints: Arc<CheckpointStore>,
    backoff: Backoff,
}

impl Copier {
    pub fn new(
        source: Arc<dyn RegistryClient>,
        destination: Arc<dyn RegistryClient>,
        checkpoints: Arc<CheckpointStore>,
        backoff: Backoff,
    ) -> Self {
        Self {
            source,
            destination,
            checkpoints,
            backoff,
        }
    }

    /// Copy the task's blob, retrying transient failures with backoff.
    /// A digest mismatch is never retried and never checkpointed.
    pub async fn execute(&self, task: &mut CopyTask, cancel: &CancellationToken) -> Result<CopyOutcome> {
        task.status = TaskStatus::Running;
        let attempts = AtomicU32::new(task.attempts);
        let started = Instant::now();

        let current: &CopyTask = task;
        let result = retry_with_backoff(&self.backoff, cancel, "blob copy", |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.transfer_once(current, cancel)
        })
        .await;

        task.attempts = attempts.load(Ordering::Relaxed);
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                task.status = TaskStatus::Failed;
                if matches!(e, ReplicationError::DigestMismatch { .. }) {
                    tracing::error!(
                        digest = %task.layer.digest,
                        destination = %task.destination_repository,
                        error = %e,
                        "blob failed verification"
                    );
                    self.discard_unverified(task).await;
                } else {
                    tracing::warn!(
                        digest = %task.layer.digest.short(),
                        attempts = task.attempts,
                        error = %e,
                        "blob copy failed"
                    );
                }
                return Err(e);
            }
        };

        self.checkpoints
            .mark_layer_complete(&task.job_id, &task.image, &task.layer.digest)
            .await?;
        task.status = TaskStatus::Completed;

        tracing::debug!(
            digest = %task.layer.digest.short(),
            size = %crate::logging::format_size(bytes),
            elapsed = %crate::logging::format_duration(started.elapsed()),
            attempts = task.attempts,
            "blob copied"
        );

        Ok(CopyOutcome {
            digest: task.layer.digest.clone(),
            bytes_transferred: bytes,
            attempts: task.attempts,
        })
    }

    /// Remove a blob the destination may have stored unverified and mark it
    /// so the next plan copies it again
    async fn discard_unverified(&self, task: &CopyTask) {
        let digest = &task.layer.digest;
        if let Err(e) = self
            .destination
            .delete_blob(&task.destination_repository, digest)
            .await
        {
            tracing::warn!(
                digest = %digest.short(),
                destination = %task.destination_repository,
                error = %e,
                "could not delete unverified blob"
            );
        }
        if let Err(e) = self
            .checkpoints
            .mark_layer_rejected(&task.job_id, &task.image, digest)
            .await
        {
            tracing::warn!(digest = %digest.short(), error = %e, "could not record rejected blob");
        }
    }

    async fn transfer_once(&self, task: &CopyTask, cancel: &CancellationToken) -> Result<u64> {
        let digest = &task.layer.digest;
        let blob = tokio::select! {
            blob = self.source.get_blob(&task.source_repository, digest) => blob?,
            _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
        };

        let size = if task.layer.size > 0 { task.layer.size } else { blob.size };
        let hasher = Arc::new(Mutex::new(DigestHasher::new()));
        let stream = hashing_stream(blob.stream, Arc::clone(&hasher));

        tokio::select! {
            uploaded = self.destination.put_blob(&task.destination_repository, digest, size, stream) => uploaded?,
            _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
        }

        let hasher = std::mem::take(&mut *hasher.lock());
        let bytes = hasher.bytes();
        hasher.verify(digest)?;
        Ok(bytes)
    }
}
