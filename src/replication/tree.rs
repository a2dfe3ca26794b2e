//! Replication of one image tree: a manifest list and its platform
//! manifests, or a single-platform image treated as a tree of one.
//!
//! Platform manifests are replicated concurrently as units on the worker
//! pool. Each unit copies the blobs its plan requires, pushes its manifest
//! by digest and checkpoints itself. The list itself is pushed last, after
//! every child is confirmed present at the destination, so a reader of the
//! destination tag never sees a list pointing at a missing child.

use crate::concurrency::{Backoff, WorkerPool, retry_with_backoff};
use crate::digest::Digest;
use crate::error::{ErrorKind, ReplicationError, Result};
use crate::image::{
    ImageManifest, ImageReference, ManifestList, ParsedManifest, Reference, parse_manifest_with_type,
};
use crate::registry::{FetchedManifest, RegistryClient};
use crate::replication::checkpoint::CheckpointStore;
use crate::replication::copier::{Copier, CopyTask};
use crate::replication::delta::DeltaAnalyzer;
use crate::replication::job::{ImageOutcome, ImageStatus, OutcomeError, PlatformOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    Pending,
    ManifestFetched,
    PlatformsInFlight,
    PlatformsComplete,
    ManifestPushed,
    Done,
    Failed,
}

impl ReplicationState {
    /// Legal forward transitions; states never move backwards
    pub fn can_advance_to(self, next: ReplicationState) -> bool {
        use ReplicationState::*;
        matches!(
            (self, next),
            (Pending, ManifestFetched)
                | (Pending, Failed)
                | (ManifestFetched, PlatformsInFlight)
                | (ManifestFetched, Done)
                | (ManifestFetched, Failed)
                | (PlatformsInFlight, PlatformsComplete)
                | (PlatformsInFlight, Failed)
                | (PlatformsComplete, ManifestPushed)
                | (PlatformsComplete, Failed)
                | (ManifestPushed, Done)
                | (ManifestPushed, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReplicationState::Done | ReplicationState::Failed)
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicationState::Pending => "pending",
            ReplicationState::ManifestFetched => "manifest_fetched",
            ReplicationState::PlatformsInFlight => "platforms_in_flight",
            ReplicationState::PlatformsComplete => "platforms_complete",
            ReplicationState::ManifestPushed => "manifest_pushed",
            ReplicationState::Done => "done",
            ReplicationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State of one tree, advanced only along legal transitions
#[derive(Debug)]
struct StateTracker {
    image: String,
    state: ReplicationState,
}

impl StateTracker {
    fn new(image: &ImageReference) -> Self {
        Self {
            image: image.to_string(),
            state: ReplicationState::Pending,
        }
    }

    fn advance(&mut self, next: ReplicationState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(ReplicationError::Internal(format!(
                "illegal transition {} -> {} for {}",
                self.state, next, self.image
            )));
        }
        tracing::debug!(image = %self.image, from = %self.state, to = %next, "tree state");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = ReplicationState::Failed;
        }
    }
}

/// One platform manifest to replicate on a worker
struct PlatformUnit {
    source_repository: String,
    destination_repository: String,
    digest: Digest,
    platform: Option<String>,
    /// Already fetched for single-platform images
    manifest: Option<FetchedManifest>,
    /// Push the manifest by digest once its blobs are in place
    push_manifest: bool,
}

struct Shared {
    job_id: String,
    dry_run: bool,
    source: Arc<dyn RegistryClient>,
    destination: Arc<dyn RegistryClient>,
    checkpoints: Arc<CheckpointStore>,
    analyzer: DeltaAnalyzer,
    copier: Copier,
    pool: Arc<WorkerPool>,
    backoff: Backoff,
}

/// Replicates image trees for one job between one source and destination
#[derive(Clone)]
pub struct TreeReplicator {
    inner: Arc<Shared>,
}

fn checkpoint_image(repository: &str, digest: &Digest) -> String {
    format!("{}@{}", repository, digest)
}

impl TreeReplicator {
    /// A dry-run replicator plans every platform without copying blobs or
    /// pushing manifests
    pub fn new(
        job_id: impl Into<String>,
        dry_run: bool,
        source: Arc<dyn RegistryClient>,
        destination: Arc<dyn RegistryClient>,
        checkpoints: Arc<CheckpointStore>,
        pool: Arc<WorkerPool>,
        backoff: Backoff,
    ) -> Self {
        let copier = Copier::new(
            Arc::clone(&source),
            Arc::clone(&destination),
            Arc::clone(&checkpoints),
            backoff.clone(),
        );
        Self {
            inner: Arc::new(Shared {
                job_id: job_id.into(),
                dry_run,
                source,
                destination,
                analyzer: DeltaAnalyzer::new(Arc::clone(&checkpoints)),
                checkpoints,
                copier,
                pool,
                backoff,
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    /// Replicate `source_ref` to `destination_ref`. Failures are reported in
    /// the outcome, never as an error.
    pub async fn replicate(
        &self,
        source_ref: &ImageReference,
        destination_ref: &ImageReference,
        cancel: &CancellationToken,
    ) -> ImageOutcome {
        let mut tracker = StateTracker::new(source_ref);
        let mut outcome = ImageOutcome::pending(source_ref.clone(), destination_ref.clone());

        match self
            .replicate_tree(source_ref, destination_ref, cancel, &mut tracker, &mut outcome)
            .await
        {
            Ok(status) => {
                outcome.status = status;
            }
            Err(e) => {
                tracker.fail();
                outcome.status = if cancel.is_cancelled() || matches!(e, ReplicationError::Cancelled) {
                    ImageStatus::Cancelled
                } else {
                    ImageStatus::Failed
                };
                if outcome.error.is_none() {
                    outcome.error = Some((&e).into());
                }
                tracing::warn!(
                    image = %source_ref,
                    state = %tracker.state,
                    error = %e,
                    "image replication failed"
                );
            }
        }

        outcome.state = tracker.state;
        outcome.tally();
        outcome
    }

    async fn replicate_tree(
        &self,
        source_ref: &ImageReference,
        destination_ref: &ImageReference,
        cancel: &CancellationToken,
        tracker: &mut StateTracker,
        outcome: &mut ImageOutcome,
    ) -> Result<ImageStatus> {
        let shared = &self.inner;
        let fetched = retry_with_backoff(&shared.backoff, cancel, "manifest fetch", |_| {
            shared
                .source
                .get_manifest(&source_ref.repository, &source_ref.reference)
        })
        .await?;
        let (_, parsed) = parse_manifest_with_type(&fetched.bytes, Some(&fetched.media_type))?;
        tracker.advance(ReplicationState::ManifestFetched)?;
        outcome.manifest_digest = Some(fetched.digest.clone());

        if self.destination_serves(destination_ref, &fetched.digest).await {
            tracing::info!(
                image = %source_ref,
                destination = %destination_ref,
                digest = %fetched.digest.short(),
                "destination is up to date"
            );
            tracker.advance(ReplicationState::Done)?;
            return Ok(ImageStatus::Skipped);
        }

        let units = match &parsed {
            ParsedManifest::List(list) => self.list_units(source_ref, destination_ref, list),
            ParsedManifest::Image(_) => vec![PlatformUnit {
                source_repository: source_ref.repository.clone(),
                destination_repository: destination_ref.repository.clone(),
                digest: fetched.digest.clone(),
                platform: None,
                manifest: Some(fetched.clone()),
                push_manifest: false,
            }],
        };

        tracker.advance(ReplicationState::PlatformsInFlight)?;
        tracing::info!(
            image = %source_ref,
            platforms = units.len(),
            dry_run = shared.dry_run,
            "replicating image"
        );

        outcome.platforms = self.run_units(units, cancel).await;

        if let Some(error) = first_platform_error(&outcome.platforms) {
            outcome.error = Some(error.clone());
            tracker.fail();
            if cancel.is_cancelled() || error.kind == ErrorKind::Cancelled {
                return Ok(ImageStatus::Cancelled);
            }
            return Ok(ImageStatus::Failed);
        }

        tracker.advance(ReplicationState::PlatformsComplete)?;
        if shared.dry_run {
            return Ok(ImageStatus::Planned);
        }

        if let ParsedManifest::List(list) = &parsed {
            self.confirm_children(&destination_ref.repository, list).await?;
        }

        let pushed = self.push_manifest(destination_ref, &fetched, cancel).await?;
        tracker.advance(ReplicationState::ManifestPushed)?;

        shared
            .checkpoints
            .mark_image_complete(
                &shared.job_id,
                &checkpoint_image(&source_ref.repository, &fetched.digest),
                &pushed,
            )
            .await?;
        tracker.advance(ReplicationState::Done)?;

        tracing::info!(
            image = %source_ref,
            destination = %destination_ref,
            digest = %pushed.short(),
            "image replicated"
        );
        Ok(ImageStatus::Replicated)
    }

    fn list_units(
        &self,
        source_ref: &ImageReference,
        destination_ref: &ImageReference,
        list: &ManifestList,
    ) -> Vec<PlatformUnit> {
        list.manifests
            .iter()
            .map(|child| PlatformUnit {
                source_repository: source_ref.repository.clone(),
                destination_repository: destination_ref.repository.clone(),
                digest: child.digest.clone(),
                platform: child.platform.as_ref().map(ToString::to_string),
                manifest: None,
                push_manifest: true,
            })
            .collect()
    }

    /// Whether the destination reference already resolves to `digest`.
    /// A failed lookup counts as "no".
    async fn destination_serves(&self, destination_ref: &ImageReference, digest: &Digest) -> bool {
        match self
            .inner
            .destination
            .manifest_digest(&destination_ref.repository, &destination_ref.reference)
            .await
        {
            Ok(existing) => existing.as_ref() == Some(digest),
            Err(e) => {
                tracing::debug!(destination = %destination_ref, error = %e, "destination lookup failed");
                false
            }
        }
    }

    /// Fan the units out on the pool and wait for all of them
    async fn run_units(&self, units: Vec<PlatformUnit>, cancel: &CancellationToken) -> Vec<PlatformOutcome> {
        let mut pending = Vec::with_capacity(units.len());
        for unit in units {
            let digest = unit.digest.clone();
            let platform = unit.platform.clone();
            let shared = Arc::clone(&self.inner);
            let handle = self
                .inner
                .pool
                .submit(Shared::replicate_platform(shared, unit, cancel.clone()))
                .await;
            pending.push((digest, platform, handle));
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for (digest, platform, handle) in pending {
            let result = match handle {
                Ok(handle) => handle.join().await,
                Err(e) => Err(e),
            };
            outcomes.push(result.unwrap_or_else(|e| PlatformOutcome::failed(digest, platform, &e)));
        }
        outcomes
    }

    /// Every child of `list` must resolve at the destination before the
    /// list is pushed
    async fn confirm_children(&self, repository: &str, list: &ManifestList) -> Result<()> {
        let checks = list.manifests.iter().map(|child| async move {
            let reference = Reference::Digest(child.digest.clone());
            let found = self
                .inner
                .destination
                .manifest_digest(repository, &reference)
                .await?;
            if found.as_ref() != Some(&child.digest) {
                return Err(ReplicationError::NotFound(format!(
                    "platform manifest {}@{} missing at destination",
                    repository, child.digest
                )));
            }
            Ok(())
        });
        futures::future::try_join_all(checks).await?;
        Ok(())
    }

    async fn push_manifest(
        &self,
        destination_ref: &ImageReference,
        fetched: &FetchedManifest,
        cancel: &CancellationToken,
    ) -> Result<Digest> {
        self.inner
            .push_manifest(
                &destination_ref.repository,
                &destination_ref.reference,
                fetched,
                cancel,
            )
            .await
    }
}

impl Shared {
    async fn push_manifest(
        &self,
        repository: &str,
        reference: &Reference,
        fetched: &FetchedManifest,
        cancel: &CancellationToken,
    ) -> Result<Digest> {
        let pushed = retry_with_backoff(&self.backoff, cancel, "manifest push", |_| {
            self.destination.put_manifest(
                repository,
                reference,
                fetched.bytes.clone(),
                &fetched.media_type,
            )
        })
        .await?;

        if pushed != fetched.digest {
            return Err(ReplicationError::DigestMismatch {
                expected: fetched.digest.to_string(),
                actual: pushed.to_string(),
            });
        }
        Ok(pushed)
    }

    async fn replicate_platform(
        self: Arc<Self>,
        unit: PlatformUnit,
        cancel: CancellationToken,
    ) -> Result<PlatformOutcome> {
        let mut outcome = PlatformOutcome::new(unit.digest.clone(), unit.platform.clone());
        if let Err(e) = self.copy_platform(&unit, &cancel, &mut outcome).await {
            tracing::warn!(
                digest = %unit.digest.short(),
                platform = unit.platform.as_deref().unwrap_or("-"),
                error = %e,
                "platform replication failed"
            );
            if outcome.error.is_none() {
                outcome.error = Some((&e).into());
            }
        }
        Ok(outcome)
    }

    async fn copy_platform(
        &self,
        unit: &PlatformUnit,
        cancel: &CancellationToken,
        outcome: &mut PlatformOutcome,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }

        let fetched = match &unit.manifest {
            Some(fetched) => fetched.clone(),
            None => {
                let reference = Reference::Digest(unit.digest.clone());
                retry_with_backoff(&self.backoff, cancel, "platform manifest fetch", |_| {
                    self.source.get_manifest(&unit.source_repository, &reference)
                })
                .await?
            }
        };

        let manifest = image_manifest(&fetched)?;
        let image = checkpoint_image(&unit.source_repository, &unit.digest);
        let target = ImageReference::by_digest(unit.destination_repository.clone(), unit.digest.clone());

        let plan = self
            .analyzer
            .plan(
                &self.job_id,
                &image,
                &unit.digest,
                &manifest,
                self.destination.as_ref(),
                &target,
            )
            .await?;
        outcome.layers_skipped = plan.skip.len();

        if !plan.push_manifest {
            outcome.resumed = true;
            if unit.push_manifest && !self.dry_run {
                self.checkpoints
                    .mark_image_complete(&self.job_id, &image, &unit.digest)
                    .await?;
            }
            return Ok(());
        }

        if self.dry_run {
            outcome.layers_transferred = plan.transfer.len();
            outcome.bytes_transferred = plan.transfer_bytes();
            return Ok(());
        }

        self.checkpoints
            .record_image_plan(&self.job_id, &image, &unit.digest, &plan.transfer_digests())
            .await?;

        let mut first_error: Option<ReplicationError> = None;
        for layer in plan.transfer {
            if cancel.is_cancelled() {
                first_error.get_or_insert(ReplicationError::Cancelled);
                break;
            }
            let mut task = CopyTask::new(
                self.job_id.clone(),
                image.clone(),
                unit.source_repository.clone(),
                unit.destination_repository.clone(),
                layer,
            );
            match self.copier.execute(&mut task, cancel).await {
                Ok(copied) => {
                    outcome.layers_transferred += 1;
                    outcome.bytes_transferred += copied.bytes_transferred;
                }
                Err(e) => {
                    let stop = e.aborts_run() || matches!(e, ReplicationError::Cancelled);
                    first_error.get_or_insert(e);
                    // Other blobs keep copying so a retry has less to do
                    if stop {
                        break;
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if unit.push_manifest {
            self.push_manifest(
                &unit.destination_repository,
                &Reference::Digest(unit.digest.clone()),
                &fetched,
                cancel,
            )
            .await?;
            self.checkpoints
                .mark_image_complete(&self.job_id, &image, &unit.digest)
                .await?;
        }
        Ok(())
    }
}

fn image_manifest(fetched: &FetchedManifest) -> Result<ImageManifest> {
    match parse_manifest_with_type(&fetched.bytes, Some(&fetched.media_type))? {
        (_, ParsedManifest::Image(manifest)) => Ok(manifest),
        (_, ParsedManifest::List(_)) => Err(ReplicationError::Unsupported(format!(
            "nested manifest list {}",
            fetched.digest
        ))),
    }
}

/// The error to report for a tree: a fatal auth failure wins so the run
/// can abort, otherwise the first failure
fn first_platform_error(platforms: &[PlatformOutcome]) -> Option<&OutcomeError> {
    let mut errors = platforms.iter().filter_map(|p| p.error.as_ref());
    let first = errors.clone().next()?;
    Some(errors.find(|e| e.kind == ErrorKind::AuthFatal).unwrap_or(first))
}
