//! Job scheduler: cron triggers, manual triggers and overlap control
//!
//! A job has at most one active run. A trigger arriving while a run is
//! active is recorded as a skipped run, or kept as the single pending
//! trigger when the job queues overlaps. Finished runs are kept in a
//! bounded per-job history; the oldest entries are evicted first.

use crate::concurrency::WorkerPool;
use crate::error::{ReplicationError, Result};
use crate::replication::job::{JobId, JobRun, OverlapPolicy, ReplicationJob, ScheduleSpec, TriggerKind};
use crate::replication::runner::JobExecutor;
use crate::replication::schedule::CronSchedule;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// What happened to a trigger
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Started { run_id: Uuid },
    /// Held until the active run finishes
    Queued,
    /// Dropped because a run was active; the skipped run is in the history
    Skipped { run: JobRun },
}

/// The run currently executing for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub run_id: Uuid,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
}

/// Active run bookkeeping; `done` yields the finalized run
struct RunningRun {
    info: ActiveRun,
    cancel: CancellationToken,
    done: watch::Receiver<Option<JobRun>>,
}

struct JobEntry {
    job: ReplicationJob,
    schedule: Option<(ScheduleSpec, CronSchedule)>,
    next_run: Option<DateTime<Utc>>,
    active: Option<RunningRun>,
    pending: Option<TriggerKind>,
    history: VecDeque<JobRun>,
    /// Unregistered while a run was still winding down; dropped once it
    /// finishes unless the job is registered again
    removed: bool,
}

impl JobEntry {
    fn overlap(&self) -> OverlapPolicy {
        self.schedule
            .as_ref()
            .map(|(spec, _)| spec.overlap)
            .unwrap_or_default()
    }

    fn record(&mut self, run: JobRun, limit: usize) {
        self.history.push_back(run);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

struct Inner {
    executor: Arc<dyn JobExecutor>,
    pool: Arc<WorkerPool>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    history_limit: usize,
    /// Bumped whenever a run is finalized
    finished: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    ticker: Arc<Mutex<Option<(CancellationToken, JoinHandle<()>)>>>,
    tick: Duration,
}

fn unknown_job(job_id: &str) -> ReplicationError {
    ReplicationError::NotFound(format!("job {}", job_id))
}

impl Scheduler {
    pub fn new(executor: Arc<dyn JobExecutor>, pool: Arc<WorkerPool>, history_limit: usize) -> Self {
        let (finished, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                executor,
                pool,
                jobs: Mutex::new(HashMap::new()),
                history_limit: history_limit.max(1),
                finished,
            }),
            ticker: Arc::new(Mutex::new(None)),
            tick: DEFAULT_TICK,
        }
    }

    /// How often the background loop looks for due jobs
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Register or replace a job. An active run of a replaced job keeps
    /// running and its history is kept.
    pub fn register_job(&self, job: ReplicationJob, spec: Option<ScheduleSpec>) -> Result<()> {
        let spec = spec.or_else(|| job.schedule.clone());
        let schedule = match spec {
            Some(spec) => {
                let cron = CronSchedule::parse(&spec.expression)?;
                Some((spec, cron))
            }
            None => None,
        };
        let next_run = schedule
            .as_ref()
            .and_then(|(_, cron)| cron.next_after(Utc::now()));

        let mut jobs = self.inner.jobs.lock();
        let job_id = job.id.clone();
        match jobs.get_mut(&job_id) {
            Some(entry) => {
                entry.job = job;
                entry.schedule = schedule;
                entry.next_run = next_run;
                entry.removed = false;
            }
            None => {
                jobs.insert(
                    job_id.clone(),
                    JobEntry {
                        job,
                        schedule,
                        next_run,
                        active: None,
                        pending: None,
                        history: VecDeque::new(),
                        removed: false,
                    },
                );
            }
        }

        tracing::info!(job_id = %job_id, next_run = ?next_run, "job registered");
        Ok(())
    }

    /// Remove a job, cancelling its active run. An entry whose run is still
    /// winding down is kept until the run finishes, so registering the same
    /// id again never starts a second concurrent run.
    pub fn unregister_job(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.inner.jobs.lock();
        let entry = jobs
            .get_mut(job_id)
            .filter(|entry| !entry.removed)
            .ok_or_else(|| unknown_job(job_id))?;

        match &entry.active {
            Some(active) => {
                active.cancel.cancel();
                tracing::info!(job_id, run_id = %active.info.run_id, "job unregistered, waiting for run to stop");
                entry.removed = true;
                entry.pending = None;
                entry.schedule = None;
                entry.next_run = None;
            }
            None => {
                jobs.remove(job_id);
                tracing::info!(job_id, "job unregistered");
            }
        }
        Ok(())
    }

    pub fn job(&self, job_id: &str) -> Result<ReplicationJob> {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .filter(|entry| !entry.removed)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| unknown_job(job_id))
    }

    pub fn trigger_now(&self, job_id: &str) -> Result<TriggerOutcome> {
        Inner::fire(&self.inner, job_id, TriggerKind::Manual)
    }

    /// Cancel the active run and drop any pending trigger. Returns whether
    /// a run was active.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.inner.jobs.lock();
        let entry = jobs.get_mut(job_id).ok_or_else(|| unknown_job(job_id))?;
        entry.pending = None;
        match &entry.active {
            Some(active) => {
                tracing::info!(job_id, run_id = %active.info.run_id, "cancelling run");
                active.cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Finalized runs, oldest first
    pub fn history(&self, job_id: &str) -> Result<Vec<JobRun>> {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.history.iter().cloned().collect())
            .ok_or_else(|| unknown_job(job_id))
    }

    pub fn active_run(&self, job_id: &str) -> Result<Option<ActiveRun>> {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.active.as_ref().map(|active| active.info.clone()))
            .ok_or_else(|| unknown_job(job_id))
    }

    pub fn has_pending_trigger(&self, job_id: &str) -> Result<bool> {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.pending.is_some())
            .ok_or_else(|| unknown_job(job_id))
    }

    pub fn next_run(&self, job_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.next_run)
            .ok_or_else(|| unknown_job(job_id))
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .inner
            .jobs
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.removed)
            .map(|(job_id, _)| job_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Cancel every active run, including runs of unregistered jobs that
    /// are still winding down
    pub fn cancel_all(&self) {
        for entry in self.inner.jobs.lock().values_mut() {
            entry.pending = None;
            if let Some(active) = &entry.active {
                active.cancel.cancel();
            }
        }
    }

    /// Wait until no job has an active run or a pending trigger
    pub async fn wait_all_idle(&self) {
        let mut finished = self.inner.finished.subscribe();
        loop {
            let busy = self
                .inner
                .jobs
                .lock()
                .values()
                .any(|entry| entry.active.is_some() || entry.pending.is_some());
            if !busy || finished.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fire every scheduled job due at `now` and advance its next fire time
    pub fn fire_due(&self, now: DateTime<Utc>) -> Vec<(JobId, TriggerOutcome)> {
        let due: Vec<JobId> = {
            let mut jobs = self.inner.jobs.lock();
            jobs.iter_mut()
                .filter_map(|(job_id, entry)| {
                    let next_run = entry.next_run?;
                    if next_run > now {
                        return None;
                    }
                    entry.next_run = entry
                        .schedule
                        .as_ref()
                        .and_then(|(_, cron)| cron.next_after(now));
                    Some(job_id.clone())
                })
                .collect()
        };

        due.into_iter()
            .filter_map(|job_id| {
                match Inner::fire(&self.inner, &job_id, TriggerKind::Scheduled) {
                    Ok(outcome) => Some((job_id, outcome)),
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "scheduled trigger failed");
                        None
                    }
                }
            })
            .collect()
    }

    /// Start the background loop firing due jobs. Starting twice is a no-op.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let scheduler = self.clone();
        let stop = token.clone();
        let tick = self.tick;
        let handle = tokio::spawn(async move {
            tracing::info!(tick_ms = tick.as_millis() as u64, "scheduler started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {
                        scheduler.fire_due(Utc::now());
                    }
                    _ = stop.cancelled() => break,
                }
            }
            tracing::info!("scheduler stopped");
        });
        *ticker = Some((token, handle));
    }

    /// Stop firing scheduled triggers. Active runs keep going; use
    /// [`cancel`](Self::cancel) to stop them.
    pub async fn stop(&self) {
        let ticker = self.ticker.lock().take();
        if let Some((token, handle)) = ticker {
            token.cancel();
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Wait until the run `run_id` of `job_id` is finalized. A run already
    /// being awaited is reported even if its job is released meanwhile.
    pub async fn wait_for_run(&self, job_id: &str, run_id: Uuid) -> Result<JobRun> {
        let mut done = {
            let jobs = self.inner.jobs.lock();
            let entry = jobs.get(job_id).ok_or_else(|| unknown_job(job_id))?;
            if let Some(run) = entry.history.iter().find(|run| run.run_id == run_id) {
                return Ok(run.clone());
            }
            match entry.active.as_ref().filter(|active| active.info.run_id == run_id) {
                Some(active) => active.done.clone(),
                None => {
                    return Err(ReplicationError::NotFound(format!("run {} of job {}", run_id, job_id)));
                }
            }
        };

        let finished = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ReplicationError::Cancelled)?;
        finished.clone().ok_or(ReplicationError::Cancelled)
    }

    /// Wait until the job has neither an active run nor a pending trigger
    pub async fn wait_idle(&self, job_id: &str) -> Result<()> {
        let mut finished = self.inner.finished.subscribe();
        loop {
            {
                let jobs = self.inner.jobs.lock();
                let entry = jobs.get(job_id).ok_or_else(|| unknown_job(job_id))?;
                if entry.active.is_none() && entry.pending.is_none() {
                    return Ok(());
                }
            }
            finished
                .changed()
                .await
                .map_err(|_| ReplicationError::Cancelled)?;
        }
    }
}

impl Inner {
    fn fire(inner: &Arc<Inner>, job_id: &str, trigger: TriggerKind) -> Result<TriggerOutcome> {
        let mut jobs = inner.jobs.lock();
        let entry = jobs
            .get_mut(job_id)
            .filter(|entry| !entry.removed)
            .ok_or_else(|| unknown_job(job_id))?;

        if entry.active.is_none() {
            let run_id = Inner::start_run(inner, entry, trigger);
            return Ok(TriggerOutcome::Started { run_id });
        }

        if entry.overlap() == OverlapPolicy::Queue && entry.pending.is_none() {
            entry.pending = Some(trigger);
            tracing::info!(job_id, trigger = ?trigger, "run active, trigger queued");
            return Ok(TriggerOutcome::Queued);
        }

        let run = JobRun::skipped(job_id, trigger);
        tracing::info!(job_id, trigger = ?trigger, "run active, trigger skipped");
        entry.record(run.clone(), inner.history_limit);
        Ok(TriggerOutcome::Skipped { run })
    }

    /// Start a run for `entry`; the caller holds the jobs lock
    fn start_run(inner: &Arc<Inner>, entry: &mut JobEntry, trigger: TriggerKind) -> Uuid {
        let run = JobRun::start(entry.job.id.clone(), trigger);
        let run_id = run.run_id;
        let cancel = CancellationToken::new();
        let (done_tx, done) = watch::channel(None);
        entry.active = Some(RunningRun {
            info: ActiveRun {
                run_id,
                trigger,
                started_at: run.started_at,
            },
            cancel: cancel.clone(),
            done,
        });

        let job = entry.job.clone();
        let job_id = job.id.clone();
        let executor = Arc::clone(&inner.executor);
        let this = Arc::clone(inner);
        let fallback = run.clone();

        let handle = inner.pool.spawn_job(async move {
            let finished = executor.execute(job, run, cancel).await;
            Ok::<_, ReplicationError>(finished)
        });

        tokio::spawn(async move {
            let finished = match handle.await {
                Ok(Ok(run)) => run,
                Ok(Err(e)) => fallback.finalize(Vec::new(), Some(&e)),
                Err(join_error) => {
                    let e = if join_error.is_cancelled() {
                        ReplicationError::Cancelled
                    } else {
                        ReplicationError::Internal(format!("job coordinator failed: {}", join_error))
                    };
                    fallback.finalize(Vec::new(), Some(&e))
                }
            };
            Inner::finish(&this, &job_id, finished.clone());
            let _ = done_tx.send(Some(finished));
        });

        run_id
    }

    fn finish(inner: &Arc<Inner>, job_id: &str, run: JobRun) {
        {
            let mut jobs = inner.jobs.lock();
            if let Some(entry) = jobs.get_mut(job_id) {
                let is_current = entry
                    .active
                    .as_ref()
                    .is_some_and(|active| active.info.run_id == run.run_id);
                if is_current {
                    entry.active = None;
                }
                entry.record(run, inner.history_limit);

                if is_current {
                    if let Some(trigger) = entry.pending.take() {
                        let run_id = Inner::start_run(inner, entry, trigger);
                        tracing::info!(job_id, run_id = %run_id, "queued trigger started");
                    }
                }
                if entry.removed && entry.active.is_none() {
                    jobs.remove(job_id);
                    tracing::info!(job_id, "unregistered job released");
                }
            }
        }
        inner.finished.send_modify(|count| *count += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryEndpoint;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Runs finish only when the test releases a permit
    struct GatedExecutor {
        gate: Semaphore,
        started: AtomicUsize,
    }

    impl GatedExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                started: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobExecutor for GatedExecutor {
        async fn execute(&self, _job: ReplicationJob, run: JobRun, cancel: CancellationToken) -> JobRun {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                permit = self.gate.acquire() => {
                    permit.unwrap().forget();
                    run.finalize(Vec::new(), None)
                }
                _ = cancel.cancelled() => run.finalize(Vec::new(), Some(&ReplicationError::Cancelled)),
            }
        }
    }

    fn job(overlap: OverlapPolicy) -> ReplicationJob {
        ReplicationJob::new(
            "nightly",
            RegistryEndpoint::generic("src.local"),
            RegistryEndpoint::generic("dst.local"),
        )
        .with_schedule(ScheduleSpec::new("0 2 * * *", overlap))
    }

    fn scheduler(executor: Arc<GatedExecutor>, history_limit: usize) -> Scheduler {
        Scheduler::new(executor, Arc::new(WorkerPool::new(2, 8, 2)), history_limit)
    }

    #[tokio::test]
    async fn test_skip_overlap_records_conflict() {
        let executor = GatedExecutor::new();
        let scheduler = scheduler(Arc::clone(&executor), 10);
        scheduler.register_job(job(OverlapPolicy::Skip), None).unwrap();

        let TriggerOutcome::Started { run_id } = scheduler.trigger_now("nightly").unwrap() else {
            panic!("first trigger should start");
        };
        let second = scheduler.trigger_now("nightly").unwrap();
        let TriggerOutcome::Skipped { run } = second else {
            panic!("second trigger should be skipped");
        };
        assert_eq!(run.status, crate::replication::job::RunStatus::Skipped);

        executor.gate.add_permits(1);
        let finished = scheduler.wait_for_run("nightly", run_id).await.unwrap();
        assert_eq!(finished.status, crate::replication::job::RunStatus::Succeeded);

        let history = scheduler.history("nightly").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(executor.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_overlap_coalesces_to_one_pending() {
        let executor = GatedExecutor::new();
        let scheduler = scheduler(Arc::clone(&executor), 10);
        scheduler.register_job(job(OverlapPolicy::Queue), None).unwrap();

        assert!(matches!(scheduler.trigger_now("nightly").unwrap(), TriggerOutcome::Started { .. }));
        assert_eq!(scheduler.trigger_now("nightly").unwrap(), TriggerOutcome::Queued);
        assert!(matches!(scheduler.trigger_now("nightly").unwrap(), TriggerOutcome::Skipped { .. }));
        assert!(scheduler.has_pending_trigger("nightly").unwrap());

        executor.gate.add_permits(2);
        scheduler.wait_idle("nightly").await.unwrap();

        assert_eq!(executor.started.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.history("nightly").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let executor = GatedExecutor::new();
        let scheduler = scheduler(Arc::clone(&executor), 2);
        scheduler.register_job(job(OverlapPolicy::Skip), None).unwrap();
        executor.gate.add_permits(3);

        let mut last = None;
        for _ in 0..3 {
            let TriggerOutcome::Started { run_id } = scheduler.trigger_now("nightly").unwrap() else {
                panic!("idle job should start");
            };
            scheduler.wait_for_run("nightly", run_id).await.unwrap();
            last = Some(run_id);
        }

        let history = scheduler.history("nightly").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().run_id, last.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_active_run() {
        let executor = GatedExecutor::new();
        let scheduler = scheduler(Arc::clone(&executor), 10);
        scheduler.register_job(job(OverlapPolicy::Skip), None).unwrap();

        let TriggerOutcome::Started { run_id } = scheduler.trigger_now("nightly").unwrap() else {
            panic!("trigger should start");
        };
        assert!(scheduler.active_run("nightly").unwrap().is_some());
        assert!(scheduler.cancel("nightly").unwrap());

        let run = scheduler.wait_for_run("nightly", run_id).await.unwrap();
        assert_eq!(run.status, crate::replication::job::RunStatus::Cancelled);
        assert!(scheduler.active_run("nightly").unwrap().is_none());
        assert!(!scheduler.cancel("nightly").unwrap());
    }

    /// Takes a while to stop after cancellation and tracks how many runs
    /// overlap
    struct SlowStopExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobExecutor for SlowStopExecutor {
        async fn execute(&self, _job: ReplicationJob, run: JobRun, cancel: CancellationToken) -> JobRun {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            run.finalize(Vec::new(), Some(&ReplicationError::Cancelled))
        }
    }

    #[tokio::test]
    async fn test_reregistered_job_waits_for_winding_down_run() {
        let executor = Arc::new(SlowStopExecutor {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(executor.clone(), Arc::new(WorkerPool::new(2, 8, 4)), 10);
        scheduler.register_job(job(OverlapPolicy::Skip), None).unwrap();

        let TriggerOutcome::Started { run_id } = scheduler.trigger_now("nightly").unwrap() else {
            panic!("trigger should start");
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.unregister_job("nightly").unwrap();
        assert!(scheduler.job_ids().is_empty());
        assert!(matches!(
            scheduler.trigger_now("nightly").unwrap_err(),
            ReplicationError::NotFound(_)
        ));

        scheduler.register_job(job(OverlapPolicy::Skip), None).unwrap();
        assert!(matches!(
            scheduler.trigger_now("nightly").unwrap(),
            TriggerOutcome::Skipped { .. }
        ));

        let old = scheduler.wait_for_run("nightly", run_id).await.unwrap();
        assert_eq!(old.status, crate::replication::job::RunStatus::Cancelled);
        assert!(matches!(
            scheduler.trigger_now("nightly").unwrap(),
            TriggerOutcome::Started { .. }
        ));
        scheduler.cancel("nightly").unwrap();
        scheduler.wait_idle("nightly").await.unwrap();
        assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_entry_is_released_after_run() {
        let executor = GatedExecutor::new();
        let scheduler = scheduler(Arc::clone(&executor), 10);
        scheduler.register_job(job(OverlapPolicy::Skip), None).unwrap();
        let TriggerOutcome::Started { run_id } = scheduler.trigger_now("nightly").unwrap() else {
            panic!("trigger should start");
        };
        scheduler.unregister_job("nightly").unwrap();
        scheduler.wait_for_run("nightly", run_id).await.unwrap();
        assert!(matches!(
            scheduler.history("nightly").unwrap_err(),
            ReplicationError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_fire_due_advances_next_run() {
        let executor = GatedExecutor::new();
        let scheduler = scheduler(Arc::clone(&executor), 10);
        scheduler.register_job(job(OverlapPolicy::Skip), None).unwrap();

        let next = scheduler.next_run("nightly").unwrap().unwrap();
        assert!(scheduler.fire_due(next - chrono::Duration::seconds(1)).is_empty());

        let fired = scheduler.fire_due(next);
        assert_eq!(fired.len(), 1);
        assert!(matches!(fired[0].1, TriggerOutcome::Started { .. }));
        assert_eq!(
            scheduler.next_run("nightly").unwrap().unwrap(),
            next + chrono::Duration::days(1)
        );

        executor.gate.add_permits(1);
        scheduler.wait_idle("nightly").await.unwrap();
        assert_eq!(scheduler.history("nightly").unwrap()[0].trigger, TriggerKind::Scheduled);
    }

    #[tokio::test]
    async fn test_unknown_job_and_bad_schedule() {
        let scheduler = scheduler(GatedExecutor::new(), 10);
        assert!(matches!(
            scheduler.trigger_now("missing").unwrap_err(),
            ReplicationError::NotFound(_)
        ));

        let bad = job(OverlapPolicy::Skip).with_schedule(ScheduleSpec::new("every day", OverlapPolicy::Skip));
        assert!(matches!(
            scheduler.register_job(bad, None).unwrap_err(),
            ReplicationError::InvalidSchedule(_)
        ));
    }
}
