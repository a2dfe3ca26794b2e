//! Execution of one job run: enumerate, filter, replicate every image
//!
//! Images of a run replicate concurrently, each as its own tree. One image
//! failing does not stop the others; a fatal authentication failure
//! cancels the rest of the run and marks it aborted.

use crate::concurrency::{Backoff, WorkerPool};
use crate::config::{HttpConfig, ReplicatorConfig};
use crate::error::{ReplicationError, Result};
use crate::image::ImageReference;
use crate::registry::transport::RegistryTransport;
use crate::registry::{AuthProvider, OciClient, RegistryClient, RegistryEndpoint};
use crate::replication::checkpoint::CheckpointStore;
use crate::replication::job::{ImageOutcome, JobRun, ReplicationJob};
use crate::replication::tree::TreeReplicator;
use crate::secrets::SecretsProvider;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Resolves the client serving an endpoint
pub trait ClientProvider: Send + Sync {
    fn client_for(&self, endpoint: &RegistryEndpoint) -> Result<Arc<dyn RegistryClient>>;
}

/// HTTP clients built on demand, sharing one connection pool and one
/// credential cache
pub struct HttpClientProvider {
    http: reqwest::Client,
    insecure_http: reqwest::Client,
    http_config: HttpConfig,
    auth: Arc<AuthProvider>,
    existence_check_concurrency: usize,
    clients: DashMap<RegistryEndpoint, Arc<OciClient>>,
}

impl HttpClientProvider {
    pub fn new(config: &ReplicatorConfig, secrets: Arc<dyn SecretsProvider>) -> Result<Self> {
        let http = RegistryTransport::http_client(&config.http, false)?;
        let insecure_http = RegistryTransport::http_client(&config.http, true)?;
        let auth = Arc::new(AuthProvider::standard(config.auth.clone(), http.clone(), secrets));
        Ok(Self {
            http,
            insecure_http,
            http_config: config.http.clone(),
            auth,
            existence_check_concurrency: config.existence_check_concurrency,
            clients: DashMap::new(),
        })
    }

    pub fn auth(&self) -> &Arc<AuthProvider> {
        &self.auth
    }
}

impl ClientProvider for HttpClientProvider {
    fn client_for(&self, endpoint: &RegistryEndpoint) -> Result<Arc<dyn RegistryClient>> {
        if let Some(client) = self.clients.get(endpoint) {
            return Ok(Arc::clone(client.value()) as Arc<dyn RegistryClient>);
        }

        let http = if endpoint.insecure {
            self.insecure_http.clone()
        } else {
            self.http.clone()
        };
        let client = Arc::new(
            OciClient::builder(endpoint.clone())
                .with_http_config(self.http_config.clone())
                .with_http_client(http)
                .with_auth(Arc::clone(&self.auth))
                .with_existence_check_concurrency(self.existence_check_concurrency)
                .build()?,
        );
        let client = self
            .clients
            .entry(endpoint.clone())
            .or_insert(client)
            .clone();
        Ok(client as Arc<dyn RegistryClient>)
    }
}

/// Fixed set of clients keyed by endpoint, for in-process backends
#[derive(Default)]
pub struct StaticClientProvider {
    clients: HashMap<String, Arc<dyn RegistryClient>>,
}

impl StaticClientProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `client` for its own endpoint
    pub fn with_client(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.clients.insert(client.endpoint().key(), client);
        self
    }
}

impl ClientProvider for StaticClientProvider {
    fn client_for(&self, endpoint: &RegistryEndpoint) -> Result<Arc<dyn RegistryClient>> {
        self.clients.get(&endpoint.key()).cloned().ok_or_else(|| {
            ReplicationError::Configuration(format!("no client registered for {}", endpoint))
        })
    }
}

/// Executes a started run and returns it finalized
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: ReplicationJob, run: JobRun, cancel: CancellationToken) -> JobRun;
}

pub struct JobRunner {
    clients: Arc<dyn ClientProvider>,
    checkpoints: Arc<CheckpointStore>,
    pool: Arc<WorkerPool>,
    backoff: Backoff,
    image_concurrency: usize,
}

impl JobRunner {
    pub fn new(
        clients: Arc<dyn ClientProvider>,
        checkpoints: Arc<CheckpointStore>,
        pool: Arc<WorkerPool>,
        config: &ReplicatorConfig,
    ) -> Self {
        let image_concurrency = pool.worker_count();
        Self {
            clients,
            checkpoints,
            pool,
            backoff: Backoff::from(&config.retry),
            image_concurrency,
        }
    }

    /// Source and destination references of every selected image
    pub async fn enumerate(
        &self,
        job: &ReplicationJob,
        source: &dyn RegistryClient,
    ) -> Result<(Vec<(ImageReference, ImageReference)>, Vec<ImageOutcome>)> {
        let selection = &job.selection;
        let repositories = match selection.literal_repositories() {
            Some(repositories) => repositories,
            None => {
                if !source.capabilities().catalog {
                    return Err(ReplicationError::Unsupported(format!(
                        "{} cannot list repositories; name them explicitly",
                        source.endpoint()
                    )));
                }
                source
                    .list_repositories()
                    .await?
                    .into_iter()
                    .filter(|repo| selection.includes_repository(repo))
                    .collect()
            }
        };

        let mut images = Vec::new();
        let mut failures = Vec::new();
        for repository in repositories {
            let destination = selection.destination_for(&repository);
            let tags = match selection.literal_tags() {
                Some(tags) => tags,
                None => match source.list_tags(&repository).await {
                    Ok(tags) => tags
                        .into_iter()
                        .filter(|tag| selection.includes_tag(tag))
                        .collect(),
                    Err(e) if e.aborts_run() => return Err(e),
                    Err(e) => {
                        tracing::warn!(repository = %repository, error = %e, "tag listing failed");
                        failures.push(ImageOutcome::failed(
                            ImageReference::tagged(repository.clone(), "*"),
                            ImageReference::tagged(destination.clone(), "*"),
                            &e,
                        ));
                        continue;
                    }
                },
            };

            for tag in tags {
                images.push((
                    ImageReference::tagged(repository.clone(), tag.clone()),
                    ImageReference::tagged(destination.clone(), tag),
                ));
            }
        }

        Ok((images, failures))
    }

    async fn run_images(
        &self,
        job: &ReplicationJob,
        cancel: &CancellationToken,
    ) -> (Vec<ImageOutcome>, Option<ReplicationError>) {
        let clients = self
            .clients
            .client_for(&job.source)
            .and_then(|source| Ok((source, self.clients.client_for(&job.destination)?)));
        let (source, destination) = match clients {
            Ok(clients) => clients,
            Err(e) => return (Vec::new(), Some(e)),
        };

        let (images, mut outcomes) = match self.enumerate(job, source.as_ref()).await {
            Ok(found) => found,
            Err(e) => return (Vec::new(), Some(e)),
        };
        tracing::info!(job_id = %job.id, images = images.len(), "images selected");

        let tree = TreeReplicator::new(
            job.id.clone(),
            job.dry_run,
            source,
            destination,
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.pool),
            self.backoff.clone(),
        );

        // Child token so an abort stops this run without touching the caller's
        let run_cancel = cancel.child_token();
        let mut abort: Option<ReplicationError> = None;
        let mut replications = futures::stream::iter(images)
            .map(|(source_ref, destination_ref)| {
                let tree = tree.clone();
                let run_cancel = run_cancel.clone();
                async move { tree.replicate(&source_ref, &destination_ref, &run_cancel).await }
            })
            .buffer_unordered(self.image_concurrency.max(1));

        while let Some(outcome) = replications.next().await {
            if abort.is_none() && outcome.aborts_run() {
                if let Some(error) = &outcome.error {
                    tracing::error!(
                        job_id = %job.id,
                        image = %outcome.source,
                        error = %error.message,
                        "fatal authentication failure, aborting run"
                    );
                    abort = Some(ReplicationError::auth_fatal(
                        outcome.source.to_string(),
                        error.message.clone(),
                    ));
                }
                run_cancel.cancel();
            }
            outcomes.push(outcome);
        }

        let error = abort.or_else(|| cancel.is_cancelled().then_some(ReplicationError::Cancelled));
        (outcomes, error)
    }
}

#[async_trait]
impl JobExecutor for JobRunner {
    async fn execute(&self, job: ReplicationJob, run: JobRun, cancel: CancellationToken) -> JobRun {
        let started = Instant::now();
        tracing::info!(job_id = %job.id, run_id = %run.run_id, trigger = ?run.trigger, "run started");

        let (outcomes, error) = self.run_images(&job, &cancel).await;
        if let Some(e) = &error {
            tracing::warn!(job_id = %job.id, run_id = %run.run_id, error = %e, "run ended early");
        }

        let run = run.finalize(outcomes, error.as_ref());
        tracing::info!(
            job_id = %job.id,
            run_id = %run.run_id,
            status = ?run.status,
            replicated = run.counts.replicated,
            skipped = run.counts.skipped,
            failed = run.counts.failed,
            transferred = %crate::logging::format_size(run.counts.bytes_transferred),
            elapsed = %crate::logging::format_duration(started.elapsed()),
            "run finished"
        );
        run
    }
}
