//! Replication jobs and the records their runs produce

use crate::digest::Digest;
use crate::error::{ErrorKind, ReplicationError};
use crate::image::ImageReference;
use crate::registry::RegistryEndpoint;
use crate::replication::tree::ReplicationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = String;

/// What to do with a trigger that fires while the job is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    /// Keep at most one pending trigger and start it when the active run ends
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Five-field cron expression evaluated in UTC
    pub expression: String,
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

impl ScheduleSpec {
    pub fn new(expression: impl Into<String>, overlap: OverlapPolicy) -> Self {
        Self {
            expression: expression.into(),
            overlap,
        }
    }
}

/// Which repositories and tags a job replicates
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Selection {
    /// Repository names or `*` patterns; empty selects the whole catalog
    pub repositories: Vec<String>,
    /// Destination repository, optionally with a `*` substituted from the
    /// matching source pattern; the source name is kept when unset
    pub destination_repository: Option<String>,
    /// Tag names or patterns; empty selects every tag
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub exclude_repositories: Vec<String>,
}

impl Selection {
    pub fn repositories<I, S>(repositories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            repositories: repositories.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination_repository = Some(destination.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub id: JobId,
    pub source: RegistryEndpoint,
    pub destination: RegistryEndpoint,
    #[serde(default)]
    pub selection: Selection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
    /// Plan every image without copying or pushing anything
    #[serde(default)]
    pub dry_run: bool,
}

impl ReplicationJob {
    pub fn new(id: impl Into<JobId>, source: RegistryEndpoint, destination: RegistryEndpoint) -> Self {
        Self {
            id: id.into(),
            source,
            destination,
            selection: Selection::default(),
            schedule: None,
            dry_run: false,
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    /// Some images failed, the rest replicated or were skipped
    PartiallyFailed,
    Failed,
    /// Stopped by a fatal authentication failure
    Aborted,
    Cancelled,
    /// Not started because another run of the job was active
    Skipped,
}

/// Error summary kept in outcomes and run history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ReplicationError> for OutcomeError {
    fn from(err: &ReplicationError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Replicated,
    /// Destination already held the image
    Skipped,
    /// Dry run: counts describe what would be copied
    Planned,
    Failed,
    Cancelled,
}

/// Result for one platform manifest of an image tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformOutcome {
    pub digest: Digest,
    /// `os/arch[/variant]`, absent for single-platform images
    pub platform: Option<String>,
    pub layers_transferred: usize,
    pub layers_skipped: usize,
    pub bytes_transferred: u64,
    /// Already complete from an earlier run
    pub resumed: bool,
    pub error: Option<OutcomeError>,
}

impl PlatformOutcome {
    pub fn new(digest: Digest, platform: Option<String>) -> Self {
        Self {
            digest,
            platform,
            layers_transferred: 0,
            layers_skipped: 0,
            bytes_transferred: 0,
            resumed: false,
            error: None,
        }
    }

    pub fn failed(digest: Digest, platform: Option<String>, err: &ReplicationError) -> Self {
        Self {
            error: Some(err.into()),
            ..Self::new(digest, platform)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOutcome {
    pub source: ImageReference,
    pub destination: ImageReference,
    pub status: ImageStatus,
    /// Where the tree state machine stopped
    pub state: ReplicationState,
    pub manifest_digest: Option<Digest>,
    pub platforms: Vec<PlatformOutcome>,
    pub layers_transferred: usize,
    pub layers_skipped: usize,
    pub bytes_transferred: u64,
    pub error: Option<OutcomeError>,
}

impl ImageOutcome {
    pub(crate) fn pending(source: ImageReference, destination: ImageReference) -> Self {
        Self {
            source,
            destination,
            status: ImageStatus::Failed,
            state: ReplicationState::Pending,
            manifest_digest: None,
            platforms: Vec::new(),
            layers_transferred: 0,
            layers_skipped: 0,
            bytes_transferred: 0,
            error: None,
        }
    }

    pub fn failed(source: ImageReference, destination: ImageReference, err: &ReplicationError) -> Self {
        let status = if matches!(err, ReplicationError::Cancelled) {
            ImageStatus::Cancelled
        } else {
            ImageStatus::Failed
        };
        Self {
            status,
            state: ReplicationState::Failed,
            error: Some(err.into()),
            ..Self::pending(source, destination)
        }
    }

    /// Sum the platform counters into the image totals
    pub(crate) fn tally(&mut self) {
        self.layers_transferred = self.platforms.iter().map(|p| p.layers_transferred).sum();
        self.layers_skipped = self.platforms.iter().map(|p| p.layers_skipped).sum();
        self.bytes_transferred = self.platforms.iter().map(|p| p.bytes_transferred).sum();
    }

    /// Whether this failure should stop the whole run
    pub fn aborts_run(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|error| error.kind == ErrorKind::AuthFatal)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, ImageStatus::Failed | ImageStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub images: usize,
    pub replicated: usize,
    pub skipped: usize,
    pub planned: usize,
    pub failed: usize,
    pub layers_transferred: usize,
    pub layers_skipped: usize,
    pub bytes_transferred: u64,
}

impl RunCounts {
    pub fn from_outcomes(outcomes: &[ImageOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut counts, outcome| {
            counts.images += 1;
            match outcome.status {
                ImageStatus::Replicated => counts.replicated += 1,
                ImageStatus::Skipped => counts.skipped += 1,
                ImageStatus::Planned => counts.planned += 1,
                ImageStatus::Failed | ImageStatus::Cancelled => counts.failed += 1,
            }
            counts.layers_transferred += outcome.layers_transferred;
            counts.layers_skipped += outcome.layers_skipped;
            counts.bytes_transferred += outcome.bytes_transferred;
            counts
        })
    }
}

/// One execution of a job. Finalized runs are never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: Uuid,
    pub job_id: JobId,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub outcomes: Vec<ImageOutcome>,
    pub counts: RunCounts,
    /// Run-level failure or the conflict that skipped this run
    pub error: Option<OutcomeError>,
}

impl JobRun {
    pub fn start(job_id: impl Into<JobId>, trigger: TriggerKind) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_id: job_id.into(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            outcomes: Vec::new(),
            counts: RunCounts::default(),
            error: None,
        }
    }

    /// Finalized record for a trigger dropped because a run was active
    pub fn skipped(job_id: impl Into<JobId>, trigger: TriggerKind) -> Self {
        let job_id = job_id.into();
        let conflict = ReplicationError::SchedulerConflict {
            job_id: job_id.clone(),
        };
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: Some(now),
            status: RunStatus::Skipped,
            error: Some((&conflict).into()),
            ..Self::start(job_id, trigger)
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Close the run with its image outcomes. `error` is a run-level failure
    /// such as a failed enumeration or a fatal authentication error.
    pub fn finalize(mut self, outcomes: Vec<ImageOutcome>, error: Option<&ReplicationError>) -> Self {
        let counts = RunCounts::from_outcomes(&outcomes);
        self.status = match error {
            Some(ReplicationError::Cancelled) => RunStatus::Cancelled,
            Some(err) if err.aborts_run() => RunStatus::Aborted,
            Some(_) => RunStatus::Failed,
            None if counts.failed == 0 => RunStatus::Succeeded,
            None if counts.failed == counts.images => RunStatus::Failed,
            None => RunStatus::PartiallyFailed,
        };
        self.error = error.map(Into::into);
        self.outcomes = outcomes;
        self.counts = counts;
        self.finished_at = Some(Utc::now());
        self
    }
}
