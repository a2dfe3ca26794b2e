//! HTTP registry client for the distribution API v2
//!
//! One [`OciClient`] serves one [`RegistryEndpoint`]. Repository names given
//! to the client are relative to the endpoint namespace.

use crate::config::{AuthConfig, HttpConfig};
use crate::digest::Digest;
use crate::error::Result;
use crate::image::Reference;
use crate::registry::endpoint::{Capabilities, RegistryEndpoint};
use crate::registry::operations::{BlobOperations, ManifestOperations, RepositoryOperations};
use crate::registry::token_manager::AuthProvider;
use crate::registry::transport::RegistryTransport;
use crate::registry::{
    BlobStream, ByteStream, DEFAULT_EXISTENCE_CHECK_CONCURRENCY, FetchedManifest, RegistryClient,
};
use crate::secrets::{EnvSecretsProvider, SecretsProvider};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::sync::Arc;

pub struct OciClientBuilder {
    endpoint: RegistryEndpoint,
    http_config: HttpConfig,
    http: Option<Client>,
    auth: Option<Arc<AuthProvider>>,
    secrets: Option<Arc<dyn SecretsProvider>>,
    existence_check_concurrency: usize,
}

impl OciClientBuilder {
    pub fn new(endpoint: RegistryEndpoint) -> Self {
        Self {
            endpoint,
            http_config: HttpConfig::default(),
            http: None,
            auth: None,
            secrets: None,
            existence_check_concurrency: DEFAULT_EXISTENCE_CHECK_CONCURRENCY,
        }
    }

    pub fn with_http_config(mut self, config: HttpConfig) -> Self {
        self.http_config = config;
        self
    }

    /// Share an HTTP client (and its connection pool) between endpoints
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Share a credential cache between clients
    pub fn with_auth(mut self, auth: Arc<AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Secrets used by the stock issuers when no [`AuthProvider`] is given
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretsProvider>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_existence_check_concurrency(mut self, limit: usize) -> Self {
        self.existence_check_concurrency = limit.max(1);
        self
    }

    pub fn build(self) -> Result<OciClient> {
        let http = match self.http {
            Some(http) => http,
            None => RegistryTransport::http_client(&self.http_config, self.endpoint.insecure)?,
        };

        let auth = match self.auth {
            Some(auth) => auth,
            None => {
                let secrets = self
                    .secrets
                    .unwrap_or_else(|| Arc::new(EnvSecretsProvider));
                Arc::new(AuthProvider::standard(
                    AuthConfig::default(),
                    http.clone(),
                    secrets,
                ))
            }
        };

        let transport = Arc::new(RegistryTransport::new(
            http,
            self.endpoint,
            auth,
            &self.http_config,
        )?);

        tracing::debug!(endpoint = %transport.endpoint(), "registry client created");

        Ok(OciClient {
            blobs: BlobOperations::new(Arc::clone(&transport)),
            manifests: ManifestOperations::new(Arc::clone(&transport)),
            repositories: RepositoryOperations::new(Arc::clone(&transport)),
            transport,
            existence_check_concurrency: self.existence_check_concurrency,
        })
    }
}

pub struct OciClient {
    transport: Arc<RegistryTransport>,
    blobs: BlobOperations,
    manifests: ManifestOperations,
    repositories: RepositoryOperations,
    existence_check_concurrency: usize,
}

impl OciClient {
    pub fn builder(endpoint: RegistryEndpoint) -> OciClientBuilder {
        OciClientBuilder::new(endpoint)
    }

    fn path(&self, repository: &str) -> String {
        self.transport.endpoint().repository_path(repository)
    }
}

#[async_trait]
impl RegistryClient for OciClient {
    fn endpoint(&self) -> &RegistryEndpoint {
        self.transport.endpoint()
    }

    fn capabilities(&self) -> Capabilities {
        self.transport.endpoint().capabilities()
    }

    fn existence_check_concurrency(&self) -> usize {
        self.existence_check_concurrency
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        let endpoint = self.transport.endpoint();
        let catalog = self.repositories.list_catalog().await?;
        Ok(catalog
            .iter()
            .filter_map(|path| endpoint.strip_namespace(path))
            .map(str::to_string)
            .collect())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.repositories.list_tags(&self.path(repository)).await
    }

    async fn get_manifest(&self, repository: &str, reference: &Reference) -> Result<FetchedManifest> {
        self.manifests
            .get_manifest(&self.path(repository), reference)
            .await
    }

    async fn manifest_digest(
        &self,
        repository: &str,
        reference: &Reference,
    ) -> Result<Option<Digest>> {
        self.manifests
            .manifest_digest(&self.path(repository), reference)
            .await
    }

    async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        self.blobs.blob_exists(&self.path(repository), digest).await
    }

    async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<BlobStream> {
        self.blobs.get_blob(&self.path(repository), digest).await
    }

    async fn put_blob(
        &self,
        repository: &str,
        digest: &Digest,
        size: u64,
        stream: ByteStream,
    ) -> Result<()> {
        self.blobs
            .put_blob(&self.path(repository), digest, size, stream)
            .await
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &Reference,
        bytes: Bytes,
        media_type: &str,
    ) -> Result<Digest> {
        self.manifests
            .put_manifest(&self.path(repository), reference, bytes, media_type)
            .await
    }

    async fn delete_image(&self, repository: &str, reference: &Reference) -> Result<()> {
        self.manifests
            .delete_manifest(&self.path(repository), reference)
            .await
    }

    async fn delete_blob(&self, repository: &str, digest: &Digest) -> Result<()> {
        self.blobs.delete_blob(&self.path(repository), digest).await
    }
}
