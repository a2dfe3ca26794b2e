mod common;

use common::{FaultyRegistry, LAYER_MEDIA_TYPE, fast_backoff, memory_registry, push_image};
use registry_replicator::error::ReplicationError;
use registry_replicator::image::{ImageManifest, ImageReference, LayerDescriptor, Reference};
use registry_replicator::registry::{MemoryRegistry, RegistryClient};
use registry_replicator::replication::{
    CheckpointStore, Copier, CopyTask, DeltaAnalyzer, SkipReason, TaskStatus,
};
use registry_replicator::Digest;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn layer(source: &MemoryRegistry, repository: &str, data: &'static [u8]) -> LayerDescriptor {
    LayerDescriptor {
        media_type: LAYER_MEDIA_TYPE.to_string(),
        size: data.len() as u64,
        digest: source.insert_blob(repository, data),
    }
}

fn task(layer: LayerDescriptor) -> CopyTask {
    CopyTask::new("job", "app@image", "app", "mirror/app", layer)
}

#[tokio::test]
async fn test_copy_streams_verifies_and_checkpoints() {
    let source = memory_registry("source.local");
    let destination = memory_registry("dest.local");
    let checkpoints = Arc::new(CheckpointStore::in_memory());
    let layer = layer(&source, "app", b"layer contents");

    let copier = Copier::new(
        source.clone(),
        destination.clone(),
        Arc::clone(&checkpoints),
        fast_backoff(3),
    );
    let mut task = task(layer.clone());
    let outcome = copier.execute(&mut task, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.digest, layer.digest);
    assert_eq!(outcome.bytes_transferred, layer.size);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(destination.has_blob("mirror/app", &layer.digest));
    assert!(checkpoints
        .is_layer_complete("job", "app@image", &layer.digest)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_transient_upload_failures_are_retried() {
    let source = memory_registry("source.local");
    let destination = Arc::new(FaultyRegistry::new(memory_registry("dest.local")));
    let checkpoints = Arc::new(CheckpointStore::in_memory());
    let layer = layer(&source, "app", b"flaky network");
    destination.fail_uploads(&layer.digest, 2);

    let copier = Copier::new(source.clone(), destination.clone(), Arc::clone(&checkpoints), fast_backoff(5));
    let mut task = task(layer.clone());
    let outcome = copier.execute(&mut task, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.attempts, 3);
    assert_eq!(task.attempts, 3);
    assert_eq!(destination.calls("put_blob"), 3);
    assert!(destination.inner().has_blob("mirror/app", &layer.digest));
}

#[tokio::test]
async fn test_exhausted_retries_leave_no_checkpoint() {
    let source = memory_registry("source.local");
    let destination = Arc::new(FaultyRegistry::new(memory_registry("dest.local")));
    let checkpoints = Arc::new(CheckpointStore::in_memory());
    let layer = layer(&source, "app", b"never arrives");
    destination.fail_uploads(&layer.digest, u32::MAX);

    let copier = Copier::new(source.clone(), destination.clone(), Arc::clone(&checkpoints), fast_backoff(3));
    let mut task = task(layer.clone());
    let err = copier.execute(&mut task, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ReplicationError::Network(_)));
    assert_eq!(task.attempts, 3);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(!checkpoints
        .is_layer_complete("job", "app@image", &layer.digest)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_corrupted_bytes_are_never_checkpointed() {
    let backing = memory_registry("source.local");
    let layer = layer(&backing, "app", b"original bytes");
    let source = Arc::new(FaultyRegistry::new(backing));
    source.faults().corrupt_blobs.insert(layer.digest.clone());
    // Destination stores whatever it receives
    let destination = Arc::new(MemoryRegistry::new("dest.local").with_upload_verification(false));
    let checkpoints = Arc::new(CheckpointStore::in_memory());

    let copier = Copier::new(source.clone(), destination.clone(), Arc::clone(&checkpoints), fast_backoff(5));
    let mut task = task(layer.clone());
    let err = copier.execute(&mut task, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ReplicationError::DigestMismatch { .. }));
    // Integrity failures are not retried
    assert_eq!(task.attempts, 1);
    assert_eq!(source.calls("get_blob"), 1);
    assert!(!checkpoints
        .is_layer_complete("job", "app@image", &layer.digest)
        .await
        .unwrap());
}

/// Copy a corrupted layer to a destination that stores uploads without
/// verifying them, then plan the same image again
async fn replan_after_corruption(refuse_delete: bool) -> (Arc<FaultyRegistry>, LayerDescriptor, Vec<Digest>) {
    let backing = memory_registry("source.local");
    push_image(&backing, "app", Some("v1"), &[b"original bytes"]);
    let fetched = backing.get_manifest("app", &Reference::Tag("v1".into())).await.unwrap();
    let manifest: ImageManifest = serde_json::from_slice(&fetched.bytes).unwrap();
    let layer = manifest.layers[0].clone();

    let source = Arc::new(FaultyRegistry::new(backing));
    source.faults().corrupt_blobs.insert(layer.digest.clone());
    let destination = Arc::new(FaultyRegistry::new(Arc::new(
        MemoryRegistry::new("dest.local").with_upload_verification(false),
    )));
    destination.faults().failing_blob_deletes = refuse_delete;
    let checkpoints = Arc::new(CheckpointStore::in_memory());

    let copier = Copier::new(source, destination.clone(), Arc::clone(&checkpoints), fast_backoff(3));
    let mut task = task(layer.clone());
    let err = copier.execute(&mut task, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ReplicationError::DigestMismatch { .. }));
    assert_eq!(destination.calls("delete_blob"), 1);

    let plan = DeltaAnalyzer::new(checkpoints)
        .plan(
            "job",
            "app@image",
            &fetched.digest,
            &manifest,
            destination.as_ref(),
            &ImageReference::tagged("mirror/app", "v1"),
        )
        .await
        .unwrap();
    assert!(!plan
        .skip
        .iter()
        .any(|(blob, reason)| blob.digest == layer.digest && *reason == SkipReason::PresentAtDestination));
    (destination, layer, plan.transfer_digests())
}

#[tokio::test]
async fn test_unverified_corrupt_blob_is_deleted_and_copied_again() {
    let (destination, layer, transfer) = replan_after_corruption(false).await;
    assert!(!destination.inner().has_blob("mirror/app", &layer.digest));
    assert!(transfer.contains(&layer.digest));
}

#[tokio::test]
async fn test_corrupt_blob_is_copied_again_when_delete_is_refused() {
    let (destination, layer, transfer) = replan_after_corruption(true).await;
    // The bad copy is still stored, so only the checkpoint marker keeps it out of the skip set
    assert!(destination.inner().has_blob("mirror/app", &layer.digest));
    assert!(transfer.contains(&layer.digest));
}

#[tokio::test]
async fn test_verifying_destination_rejects_corruption() {
    let backing = memory_registry("source.local");
    let layer = layer(&backing, "app", b"original bytes");
    let source = Arc::new(FaultyRegistry::new(backing));
    source.faults().corrupt_blobs.insert(layer.digest.clone());
    let destination = memory_registry("dest.local");
    let checkpoints = Arc::new(CheckpointStore::in_memory());

    let copier = Copier::new(source, destination.clone(), Arc::clone(&checkpoints), fast_backoff(5));
    let mut task = task(layer.clone());
    let err = copier.execute(&mut task, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ReplicationError::DigestMismatch { .. }));
    assert!(!destination.has_blob("mirror/app", &layer.digest));
}

#[tokio::test]
async fn test_missing_source_blob_is_not_found() {
    let source = memory_registry("source.local");
    let destination = memory_registry("dest.local");
    let layer = LayerDescriptor {
        media_type: LAYER_MEDIA_TYPE.to_string(),
        size: 4,
        digest: Digest::compute(b"gone"),
    };

    let copier = Copier::new(source, destination, Arc::new(CheckpointStore::in_memory()), fast_backoff(3));
    let mut task = task(layer);
    let err = copier.execute(&mut task, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ReplicationError::NotFound(_)));
    assert_eq!(task.attempts, 1);
}

#[tokio::test]
async fn test_cancel_stops_an_upload_in_flight() {
    let source = memory_registry("source.local");
    let destination = Arc::new(FaultyRegistry::new(memory_registry("dest.local")));
    destination.faults().upload_delay = Some(Duration::from_secs(30));
    let checkpoints = Arc::new(CheckpointStore::in_memory());
    let layer = layer(&source, "app", b"slow upload");

    let copier = Arc::new(Copier::new(
        source,
        destination.clone(),
        Arc::clone(&checkpoints),
        fast_backoff(3),
    ));
    let cancel = CancellationToken::new();
    let running = {
        let copier = Arc::clone(&copier);
        let cancel = cancel.clone();
        let layer = layer.clone();
        tokio::spawn(async move {
            let mut task = task(layer);
            copier.execute(&mut task, &cancel).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("copy did not stop after cancel")
        .unwrap();

    assert!(matches!(result, Err(ReplicationError::Cancelled)));
    assert!(!destination.inner().has_blob("mirror/app", &layer.digest));
    assert!(!checkpoints
        .is_layer_complete("job", "app@image", &layer.digest)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_cancelled_token_prevents_any_transfer() {
    let source = Arc::new(FaultyRegistry::new(memory_registry("source.local")));
    let layer = layer(source.inner(), "app", b"untouched");
    let copier = Copier::new(
        source.clone(),
        memory_registry("dest.local"),
        Arc::new(CheckpointStore::in_memory()),
        fast_backoff(3),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut task = task(layer);
    let err = copier.execute(&mut task, &cancel).await.unwrap_err();
    assert!(matches!(err, ReplicationError::Cancelled));
    assert_eq!(source.calls("get_blob"), 0);
}
