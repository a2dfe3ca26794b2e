//! Replication engine
//!
//! A [`ReplicationJob`] names a source and destination endpoint and the
//! images to move. Each run enumerates the selection, plans every image
//! against the destination and copies only the blobs that are missing:
//!
//! - [`delta`] decides what to transfer
//! - [`copier`] streams and verifies single blobs
//! - [`tree`] replicates manifest lists and their platform manifests
//! - [`checkpoint`] records progress so interrupted runs resume
//! - [`runner`] executes a run, [`scheduler`] decides when runs happen
//! - [`service`] is the control surface tying them together

pub mod checkpoint;
pub mod copier;
pub mod delta;
pub mod job;
pub mod rules;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod tree;

pub use checkpoint::{Checkpoint, CheckpointStore, ImageCheckpoint, JobCheckpoints};
pub use copier::{Copier, CopyOutcome, CopyTask, TaskStatus};
pub use delta::{CopyPlan, DeltaAnalyzer, SkipReason};
pub use job::{
    ImageOutcome, ImageStatus, JobId, JobRun, OutcomeError, OverlapPolicy, PlatformOutcome,
    ReplicationJob, RunCounts, RunStatus, ScheduleSpec, Selection, TriggerKind,
};
pub use runner::{ClientProvider, HttpClientProvider, JobExecutor, JobRunner, StaticClientProvider};
pub use schedule::CronSchedule;
pub use scheduler::{ActiveRun, Scheduler, TriggerOutcome};
pub use service::{JobStatus, ReplicationService, Submission};
pub use tree::{ReplicationState, TreeReplicator};
