//! Job control surface
//!
//! [`ReplicationService`] wires the worker pool, checkpoint store, runner
//! and scheduler together and exposes the operations an embedding
//! application or API layer calls.

use crate::concurrency::WorkerPool;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::replication::checkpoint::{CheckpointStore, JobCheckpoints};
use crate::replication::job::{JobId, JobRun, ReplicationJob};
use crate::replication::runner::{ClientProvider, HttpClientProvider, JobRunner};
use crate::replication::scheduler::{ActiveRun, Scheduler, TriggerOutcome};
use crate::secrets::SecretsProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Snapshot of one job for status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub active_run: Option<ActiveRun>,
    pub pending_trigger: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<JobRun>,
    pub history: Vec<JobRun>,
}

/// Result of submitting a job
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job_id: JobId,
    /// Set when the job was started right away
    pub trigger: Option<TriggerOutcome>,
}

impl Submission {
    pub fn run_id(&self) -> Option<Uuid> {
        match &self.trigger {
            Some(TriggerOutcome::Started { run_id }) => Some(*run_id),
            _ => None,
        }
    }
}

pub struct ReplicationService {
    scheduler: Scheduler,
    checkpoints: Arc<CheckpointStore>,
    pool: Arc<WorkerPool>,
}

impl ReplicationService {
    /// Must be called inside a Tokio runtime
    pub fn new(
        config: &ReplicatorConfig,
        clients: Arc<dyn ClientProvider>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(WorkerPool::from_config(config));
        let runner = Arc::new(JobRunner::new(
            clients,
            Arc::clone(&checkpoints),
            Arc::clone(&pool),
            config,
        ));
        let scheduler = Scheduler::new(runner, Arc::clone(&pool), config.history_limit);

        Ok(Self {
            scheduler,
            checkpoints,
            pool,
        })
    }

    /// Service talking to registries over HTTP with checkpoints placed as
    /// configured
    pub async fn from_config(config: &ReplicatorConfig, secrets: Arc<dyn SecretsProvider>) -> Result<Self> {
        let clients = Arc::new(HttpClientProvider::new(config, secrets)?);
        let checkpoints = Arc::new(CheckpointStore::from_config(&config.checkpoint).await?);
        Self::new(config, clients, checkpoints)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Register a job. Jobs without a schedule run once immediately;
    /// scheduled jobs wait for their first fire time.
    pub fn submit_replication_job(&self, job: ReplicationJob) -> Result<Submission> {
        if job.id.trim().is_empty() {
            return Err(ReplicationError::Configuration("job id must not be empty".to_string()));
        }
        if job.source == job.destination && job.selection.destination_repository.is_none() {
            return Err(ReplicationError::Configuration(format!(
                "job {} replicates {} onto itself",
                job.id, job.source
            )));
        }

        let job_id = job.id.clone();
        let one_off = job.schedule.is_none();
        self.scheduler.register_job(job, None)?;

        let trigger = if one_off {
            Some(self.scheduler.trigger_now(&job_id)?)
        } else {
            None
        };
        tracing::info!(job_id = %job_id, one_off, "job submitted");
        Ok(Submission { job_id, trigger })
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<JobStatus> {
        let history = self.scheduler.history(job_id)?;
        Ok(JobStatus {
            job_id: job_id.to_string(),
            active_run: self.scheduler.active_run(job_id)?,
            pending_trigger: self.scheduler.has_pending_trigger(job_id)?,
            next_run: self.scheduler.next_run(job_id)?,
            last_run: history.last().cloned(),
            history,
        })
    }

    pub async fn list_checkpoints(&self, job_id: &str) -> Result<JobCheckpoints> {
        self.checkpoints.list_checkpoints(job_id).await
    }

    /// Cancel the active run. Returns whether one was active.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        self.scheduler.cancel(job_id)
    }

    pub fn trigger_job(&self, job_id: &str) -> Result<TriggerOutcome> {
        self.scheduler.trigger_now(job_id)
    }

    pub fn remove_job(&self, job_id: &str) -> Result<()> {
        self.scheduler.unregister_job(job_id)
    }

    pub async fn wait_for_run(&self, job_id: &str, run_id: Uuid) -> Result<JobRun> {
        self.scheduler.wait_for_run(job_id, run_id).await
    }

    /// Start firing scheduled jobs
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stop the scheduler, cancel active runs and stop the workers
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.scheduler.cancel_all();
        self.scheduler.wait_all_idle().await;
        self.pool.stop().await;
        tracing::info!("replication service stopped");
    }
}
