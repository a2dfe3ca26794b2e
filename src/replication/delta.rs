//! Delta planning: decide which blobs of an image must actually move
//!
//! A blob is skipped when this job already checkpointed it or when the
//! destination already holds it. A failed existence check is never read as
//! "present"; the blob is transferred instead.

use crate::digest::Digest;
use crate::error::Result;
use crate::image::{ImageManifest, ImageReference, LayerDescriptor};
use crate::registry::RegistryClient;
use crate::replication::checkpoint::CheckpointStore;
use std::sync::Arc;

/// Why a blob is not transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Checkpointed by an earlier attempt of this job
    Checkpointed,
    /// The destination repository already has it
    PresentAtDestination,
    /// The destination already serves the whole manifest
    ManifestPresent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyPlan {
    pub manifest_digest: Digest,
    /// Blobs to copy, in upload order
    pub transfer: Vec<LayerDescriptor>,
    pub skip: Vec<(LayerDescriptor, SkipReason)>,
    /// False when the destination already serves the manifest
    pub push_manifest: bool,
}

impl CopyPlan {
    /// Nothing to copy and nothing to push
    pub fn is_noop(&self) -> bool {
        self.transfer.is_empty() && !self.push_manifest
    }

    pub fn transfer_bytes(&self) -> u64 {
        self.transfer.iter().map(|layer| layer.size).sum()
    }

    pub fn transfer_digests(&self) -> Vec<Digest> {
        self.transfer.iter().map(|layer| layer.digest.clone()).collect()
    }
}

pub struct DeltaAnalyzer {
    checkpoints: Arc<CheckpointStore>,
}

impl DeltaAnalyzer {
    pub fn new(checkpoints: Arc<CheckpointStore>) -> Self {
        Self { checkpoints }
    }

    /// Plan the copy of `manifest` to `destination_ref`.
    ///
    /// `image` is the checkpoint key of the source manifest. Checkpoint
    /// corruption fails the plan; destination lookups that fail only make
    /// the plan more conservative.
    pub async fn plan(
        &self,
        job_id: &str,
        image: &str,
        manifest_digest: &Digest,
        manifest: &ImageManifest,
        destination: &dyn RegistryClient,
        destination_ref: &ImageReference,
    ) -> Result<CopyPlan> {
        let blobs = manifest.blobs();

        match destination
            .manifest_digest(&destination_ref.repository, &destination_ref.reference)
            .await
        {
            Ok(Some(existing)) if &existing == manifest_digest => {
                tracing::debug!(
                    image,
                    destination = %destination_ref,
                    "destination already serves manifest"
                );
                return Ok(CopyPlan {
                    manifest_digest: manifest_digest.clone(),
                    transfer: Vec::new(),
                    skip: blobs
                        .into_iter()
                        .map(|blob| (blob, SkipReason::ManifestPresent))
                        .collect(),
                    push_manifest: false,
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    image,
                    destination = %destination_ref,
                    error = %e,
                    "destination manifest lookup failed, planning full copy"
                );
            }
        }

        let mut skip = Vec::new();
        let mut unknown = Vec::new();
        let mut transfer = Vec::new();
        for blob in blobs {
            if self
                .checkpoints
                .is_layer_complete(job_id, image, &blob.digest)
                .await?
            {
                skip.push((blob, SkipReason::Checkpointed));
            } else if self
                .checkpoints
                .is_layer_rejected(job_id, image, &blob.digest)
                .await?
            {
                // Whatever the destination holds under this digest failed verification
                transfer.push(blob);
            } else {
                unknown.push(blob);
            }
        }

        let digests: Vec<Digest> = unknown.iter().map(|blob| blob.digest.clone()).collect();
        let existence = if digests.is_empty() {
            Default::default()
        } else {
            destination
                .blobs_exist(&destination_ref.repository, &digests)
                .await
        };

        for blob in unknown {
            match existence.get(&blob.digest) {
                Some(Ok(true)) => skip.push((blob, SkipReason::PresentAtDestination)),
                Some(Ok(false)) | None => transfer.push(blob),
                Some(Err(e)) => {
                    tracing::debug!(
                        digest = %blob.digest.short(),
                        error = %e,
                        "existence check failed, transferring"
                    );
                    transfer.push(blob);
                }
            }
        }

        // Smallest first unless the backend requires manifest order
        if !destination.capabilities().ordered_layer_upload {
            transfer.sort_by_key(|blob| blob.size);
        }

        tracing::debug!(
            image,
            transfer = transfer.len(),
            skip = skip.len(),
            "copy plan ready"
        );

        Ok(CopyPlan {
            manifest_digest: manifest_digest.clone(),
            transfer,
            skip,
            push_manifest: true,
        })
    }
}
