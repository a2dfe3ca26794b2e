//! Durable progress records for resuming interrupted replications
//!
//! Records are keyed by job and image:
//!
//! - `checkpoints/{job}/{image}/layers/{digest}` marks one blob as copied
//! - `checkpoints/{job}/{image}/image` holds the planned blob set and
//!   whether the image finished
//!
//! `image` is the `repo@digest` of the source manifest. Records only ever
//! move forward: a completed layer or image is never reset. A layer record
//! that is not complete marks a blob that failed verification; planning
//! copies it again without trusting the destination. Writes for the same
//! image are serialized; different images proceed independently.

pub mod store;

pub use store::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};

use crate::config::CheckpointConfig;
use crate::digest::Digest;
use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const ROOT: &str = "checkpoints";

/// A blob copied to the destination for one image of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub image: String,
    pub digest: Digest,
    pub completed: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Planned blob set of one image and whether its manifest was pushed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCheckpoint {
    pub job_id: String,
    pub image: String,
    pub manifest_digest: Digest,
    pub layers: Vec<Digest>,
    pub completed: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Everything recorded for one job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCheckpoints {
    pub images: Vec<ImageCheckpoint>,
    pub layers: Vec<Checkpoint>,
}

pub struct CheckpointStore {
    kv: Arc<dyn KeyValueStore>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            locks: DashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()))
    }

    /// File-backed when a directory is configured, in memory otherwise
    pub async fn from_config(config: &CheckpointConfig) -> Result<Self> {
        match &config.directory {
            Some(directory) => Ok(Self::new(Arc::new(FileKeyValueStore::open(directory).await?))),
            None => Ok(Self::in_memory()),
        }
    }

    fn layer_key(job_id: &str, image: &str, digest: &Digest) -> String {
        format!("{}/{}/{}/layers/{}", ROOT, job_id, image, digest)
    }

    fn image_key(job_id: &str, image: &str) -> String {
        format!("{}/{}/{}/image", ROOT, job_id, image)
    }

    fn lock_for(&self, job_id: &str, image: &str) -> (String, Arc<tokio::sync::Mutex<()>>) {
        let key = format!("{}/{}", job_id, image);
        let lock = self.locks.entry(key.clone()).or_default().clone();
        (key, lock)
    }

    /// Drop the lock of an image nobody else is waiting on
    fn release_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.kv.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ReplicationError::CheckpointCorruption {
                key: key.to_string(),
                reason: format!("undecodable record: {}", e),
            })
    }

    async fn write<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        self.kv.put(key, serde_json::to_vec(record)?).await
    }

    async fn read_layer(&self, job_id: &str, image: &str, digest: &Digest) -> Result<Option<Checkpoint>> {
        let key = Self::layer_key(job_id, image, digest);
        let record: Option<Checkpoint> = self.read(&key).await?;
        match record {
            Some(record) if record.job_id != job_id || record.image != image || &record.digest != digest => {
                Err(ReplicationError::CheckpointCorruption {
                    key,
                    reason: "record does not belong to its key".to_string(),
                })
            }
            other => Ok(other),
        }
    }

    async fn read_image(&self, job_id: &str, image: &str) -> Result<Option<ImageCheckpoint>> {
        let key = Self::image_key(job_id, image);
        let record: Option<ImageCheckpoint> = self.read(&key).await?;
        match record {
            Some(record) if record.job_id != job_id || record.image != image => {
                Err(ReplicationError::CheckpointCorruption {
                    key,
                    reason: "record does not belong to its key".to_string(),
                })
            }
            other => Ok(other),
        }
    }

    /// Record a blob as copied. Marking an already completed blob is a no-op.
    pub async fn mark_layer_complete(&self, job_id: &str, image: &str, digest: &Digest) -> Result<()> {
        let (key, lock) = self.lock_for(job_id, image);
        let guard = lock.lock().await;
        let result = self.write_layer(job_id, image, digest, true).await;
        drop(guard);
        self.release_lock(&key, lock);
        result?;
        tracing::trace!(job_id, image, digest = %digest.short(), "layer checkpointed");
        Ok(())
    }

    /// Record that the destination copy of a blob failed verification. A
    /// completed blob keeps its record.
    pub async fn mark_layer_rejected(&self, job_id: &str, image: &str, digest: &Digest) -> Result<()> {
        let (key, lock) = self.lock_for(job_id, image);
        let guard = lock.lock().await;
        let result = self.write_layer(job_id, image, digest, false).await;
        drop(guard);
        self.release_lock(&key, lock);
        result?;
        tracing::debug!(job_id, image, digest = %digest.short(), "layer marked as rejected");
        Ok(())
    }

    async fn write_layer(&self, job_id: &str, image: &str, digest: &Digest, completed: bool) -> Result<()> {
        if let Some(existing) = self.read_layer(job_id, image, digest).await? {
            if existing.completed || existing.completed == completed {
                return Ok(());
            }
        }

        let record = Checkpoint {
            job_id: job_id.to_string(),
            image: image.to_string(),
            digest: digest.clone(),
            completed,
            recorded_at: Utc::now(),
        };
        self.write(&Self::layer_key(job_id, image, digest), &record).await
    }

    pub async fn is_layer_complete(&self, job_id: &str, image: &str, digest: &Digest) -> Result<bool> {
        Ok(self
            .read_layer(job_id, image, digest)
            .await?
            .is_some_and(|record| record.completed))
    }

    /// Whether the blob failed verification and has not been copied since
    pub async fn is_layer_rejected(&self, job_id: &str, image: &str, digest: &Digest) -> Result<bool> {
        Ok(self
            .read_layer(job_id, image, digest)
            .await?
            .is_some_and(|record| !record.completed))
    }

    /// Record the blobs an image needs before copying starts. A completed
    /// image keeps its record.
    pub async fn record_image_plan(
        &self,
        job_id: &str,
        image: &str,
        manifest_digest: &Digest,
        layers: &[Digest],
    ) -> Result<()> {
        let (key, lock) = self.lock_for(job_id, image);
        let guard = lock.lock().await;
        let result = self.write_image_plan(job_id, image, manifest_digest, layers).await;
        drop(guard);
        self.release_lock(&key, lock);
        result
    }

    async fn write_image_plan(
        &self,
        job_id: &str,
        image: &str,
        manifest_digest: &Digest,
        layers: &[Digest],
    ) -> Result<()> {
        if let Some(existing) = self.read_image(job_id, image).await? {
            if existing.completed {
                return Ok(());
            }
        }

        let record = ImageCheckpoint {
            job_id: job_id.to_string(),
            image: image.to_string(),
            manifest_digest: manifest_digest.clone(),
            layers: layers.to_vec(),
            completed: false,
            recorded_at: Utc::now(),
        };
        self.write(&Self::image_key(job_id, image), &record).await
    }

    /// Record that the image manifest reached the destination
    pub async fn mark_image_complete(&self, job_id: &str, image: &str, manifest_digest: &Digest) -> Result<()> {
        let (key, lock) = self.lock_for(job_id, image);
        let guard = lock.lock().await;
        let result = self.write_image_complete(job_id, image, manifest_digest).await;
        drop(guard);
        self.release_lock(&key, lock);
        result
    }

    async fn write_image_complete(&self, job_id: &str, image: &str, manifest_digest: &Digest) -> Result<()> {
        let existing = self.read_image(job_id, image).await?;
        if existing.as_ref().is_some_and(|record| record.completed) {
            return Ok(());
        }

        let record = ImageCheckpoint {
            job_id: job_id.to_string(),
            image: image.to_string(),
            manifest_digest: manifest_digest.clone(),
            layers: existing.map(|record| record.layers).unwrap_or_default(),
            completed: true,
            recorded_at: Utc::now(),
        };
        self.write(&Self::image_key(job_id, image), &record).await?;
        tracing::debug!(job_id, image, "image checkpointed as complete");
        Ok(())
    }

    pub async fn is_image_complete(&self, job_id: &str, image: &str) -> Result<bool> {
        Ok(self
            .read_image(job_id, image)
            .await?
            .is_some_and(|record| record.completed))
    }

    /// Blobs of a planned image still to copy, in plan order. `None` when
    /// no plan was recorded. A completed image whose planned blobs are not
    /// all checkpointed is reported as corruption.
    pub async fn get_resume_point(&self, job_id: &str, image: &str) -> Result<Option<Vec<Digest>>> {
        let Some(record) = self.read_image(job_id, image).await? else {
            return Ok(None);
        };

        let mut remaining = Vec::new();
        for digest in &record.layers {
            if !self.is_layer_complete(job_id, image, digest).await? {
                remaining.push(digest.clone());
            }
        }

        if record.completed && !remaining.is_empty() {
            return Err(ReplicationError::CheckpointCorruption {
                key: Self::image_key(job_id, image),
                reason: format!(
                    "image marked complete with {} uncopied layers",
                    remaining.len()
                ),
            });
        }
        Ok(Some(remaining))
    }

    /// All records of a job
    pub async fn list_checkpoints(&self, job_id: &str) -> Result<JobCheckpoints> {
        let prefix = format!("{}/{}/", ROOT, job_id);
        let mut checkpoints = JobCheckpoints::default();

        for key in self.kv.list(&prefix).await? {
            if key.ends_with("/image") {
                let Some(record) = self.read::<ImageCheckpoint>(&key).await? else {
                    continue;
                };
                if Self::image_key(&record.job_id, &record.image) != key {
                    return Err(ReplicationError::CheckpointCorruption {
                        key,
                        reason: "record does not belong to its key".to_string(),
                    });
                }
                checkpoints.images.push(record);
            } else if key.contains("/layers/") {
                let Some(record) = self.read::<Checkpoint>(&key).await? else {
                    continue;
                };
                if Self::layer_key(&record.job_id, &record.image, &record.digest) != key {
                    return Err(ReplicationError::CheckpointCorruption {
                        key,
                        reason: "record does not belong to its key".to_string(),
                    });
                }
                checkpoints.layers.push(record);
            }
        }

        tracing::debug!(
            job_id,
            images = checkpoints.images.len(),
            layers = checkpoints.layers.len(),
            "listed checkpoints"
        );
        Ok(checkpoints)
    }

    /// Remove every record of a job
    pub async fn clear_job(&self, job_id: &str) -> Result<usize> {
        let prefix = format!("{}/{}/", ROOT, job_id);
        let keys = self.kv.list(&prefix).await?;
        for key in &keys {
            self.kv.delete(key).await?;
        }
        self.locks.retain(|key, _| !key.starts_with(&format!("{}/", job_id)));
        Ok(keys.len())
    }
}
