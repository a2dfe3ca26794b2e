//! Registry endpoints and the backend kinds they speak

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// How a registry authenticates; selects the token issuer statically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Cloud registry issuing region-scoped authorization tokens
    RegionScoped,
    /// Cloud registry accepting OAuth2 access tokens
    TokenBased,
    /// Any OCI distribution registry using bearer or basic challenges
    GenericBearer,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::RegionScoped => "region_scoped",
            BackendKind::TokenBased => "token_based",
            BackendKind::GenericBearer => "generic_bearer",
        }
    }

    /// Capabilities every registry of this kind offers over the HTTP API.
    /// The distribution API has no bulk existence call, so no kind claims one.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            catalog: true,
            bulk_blob_check: false,
            ordered_layer_upload: false,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Repositories can be enumerated
    pub catalog: bool,
    /// Existence of many blobs can be checked in one call
    pub bulk_blob_check: bool,
    /// Layers must be uploaded in manifest order
    pub ordered_layer_upload: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryEndpoint {
    pub backend: BackendKind,
    /// Host with optional port, e.g. `registry.example.com:5000`
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Repository path prefix all replicated repositories live under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Use plain HTTP
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub ordered_layer_upload: bool,
}

impl RegistryEndpoint {
    pub fn new(backend: BackendKind, host: impl Into<String>) -> Self {
        Self {
            backend,
            host: host.into(),
            region: None,
            namespace: None,
            insecure: false,
            ordered_layer_upload: false,
        }
    }

    pub fn generic(host: impl Into<String>) -> Self {
        Self::new(BackendKind::GenericBearer, host)
    }

    pub fn region_scoped(host: impl Into<String>, region: impl Into<String>) -> Self {
        let mut endpoint = Self::new(BackendKind::RegionScoped, host);
        endpoint.region = Some(region.into());
        endpoint
    }

    pub fn token_based(host: impl Into<String>) -> Self {
        Self::new(BackendKind::TokenBased, host)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into().trim_matches('/').to_string();
        self.namespace = (!namespace.is_empty()).then_some(namespace);
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Credential cache slot for this endpoint
    pub fn key(&self) -> String {
        match &self.region {
            Some(region) => format!("{}://{}#{}", self.backend, self.host, region),
            None => format!("{}://{}", self.backend, self.host),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let mut capabilities = self.backend.capabilities();
        capabilities.ordered_layer_upload |= self.ordered_layer_upload;
        capabilities
    }

    pub fn base_url(&self) -> Result<Url> {
        if self.host.is_empty() {
            return Err(ReplicationError::Configuration(
                "registry host must not be empty".to_string(),
            ));
        }
        let scheme = if self.insecure { "http" } else { "https" };
        Ok(Url::parse(&format!("{}://{}/", scheme, self.host))?)
    }

    /// Full repository path on the registry, namespace included
    pub fn repository_path(&self, repository: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}/{}", namespace, repository.trim_start_matches('/')),
            None => repository.to_string(),
        }
    }

    /// Inverse of [`repository_path`](Self::repository_path); `None` outside the namespace
    pub fn strip_namespace<'a>(&self, path: &'a str) -> Option<&'a str> {
        match &self.namespace {
            Some(namespace) => path
                .strip_prefix(namespace.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .filter(|rest| !rest.is_empty()),
            None => Some(path),
        }
    }
}

impl fmt::Display for RegistryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", self.host, namespace),
            None => f.write_str(&self.host),
        }
    }
}
