//! Bounded worker pool for replication work
//!
//! Transfer units go through a bounded queue consumed by a fixed number of
//! workers, so submitters wait once `queue_depth` units are pending. Job
//! coordinators run in a separate lane limited by `max_concurrent_jobs`; a
//! coordinator waiting on its platform units never holds a transfer worker.

use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Job = BoxFuture<'static, ()>;

/// Completion handle for a unit submitted with [`WorkerPool::submit`]
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the unit to finish. A unit dropped by a stopping pool
    /// reports [`ReplicationError::Cancelled`].
    pub async fn join(self) -> Result<T> {
        self.receiver
            .await
            .unwrap_or(Err(ReplicationError::Cancelled))
    }
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    job_lane: Arc<Semaphore>,
    worker_count: usize,
}

impl WorkerPool {
    /// Start `workers` executors. Must be called inside a Tokio runtime.
    pub fn new(workers: usize, queue_depth: usize, max_concurrent_jobs: usize) -> Self {
        let worker_count = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue_depth.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = CancellationToken::new();

        let handles = (0..worker_count)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let shutdown = shutdown.clone();
                tokio::spawn(worker_loop(id, receiver, shutdown))
            })
            .collect();

        tracing::debug!(workers = worker_count, queue_depth, max_concurrent_jobs, "worker pool started");

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            shutdown,
            job_lane: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            worker_count,
        }
    }

    pub fn from_config(config: &ReplicatorConfig) -> Self {
        Self::new(config.workers, config.queue_depth, config.max_concurrent_jobs)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Queue a unit for the transfer workers, waiting while the queue is full
    pub async fn submit<F, T>(&self, unit: F) -> Result<TaskHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(ReplicationError::Cancelled)?;

        let (tx, rx) = oneshot::channel();
        let job: Job = async move {
            let result = match AssertUnwindSafe(unit).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(ReplicationError::Internal("worker task panicked".to_string())),
            };
            let _ = tx.send(result);
        }
        .boxed();

        sender
            .send(job)
            .await
            .map_err(|_| ReplicationError::Cancelled)?;

        Ok(TaskHandle { receiver: rx })
    }

    /// Run a job coordinator in the job lane
    pub fn spawn_job<F, T>(&self, coordinator: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let lane = Arc::clone(&self.job_lane);
        tokio::spawn(async move {
            let _permit = lane
                .acquire_owned()
                .await
                .map_err(|_| ReplicationError::Cancelled)?;
            coordinator.await
        })
    }

    /// Stop accepting work, abandon queued units and wait for the workers
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.sender.lock().take();
        self.job_lane.close();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                job = receiver.recv() => job,
            }
        };

        let Some(job) = job else {
            break;
        };

        tokio::select! {
            _ = job => {}
            _ = shutdown.cancelled() => break,
        }
    }
    tracing::trace!(worker = id, "worker exited");
}
