//! Repository operations for registry client
//!
//! Implements Docker Registry v2 listing operations, following `Link`
//! pagination headers:
//! - Catalog (GET /v2/_catalog)
//! - Tag list (GET /v2/{name}/tags/list)

use crate::error::Result;
use crate::registry::transport::{CATALOG_SCOPE, RegistryTransport, next_link, repository_scope};
use serde::Deserialize;
use std::sync::Arc;

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct RepositoryOperations {
    transport: Arc<RegistryTransport>,
}

impl RepositoryOperations {
    pub fn new(transport: Arc<RegistryTransport>) -> Self {
        Self { transport }
    }

    /// Every repository path in the catalog
    pub async fn list_catalog(&self) -> Result<Vec<String>> {
        let first = format!("v2/_catalog?n={}", PAGE_SIZE);
        let mut next = Some(self.transport.url(&first)?);
        let mut repositories = Vec::new();
        let timeout = self.transport.request_timeout();

        while let Some(url) = next.take() {
            let response = self
                .transport
                .send(Some(CATALOG_SCOPE), "catalog listing", |http| {
                    http.get(url.clone()).timeout(timeout)
                })
                .await?;

            if !response.status().is_success() {
                return Err(self.transport.error_for(response, "catalog listing").await);
            }

            next = next_link(&response)
                .map(|link| self.transport.resolve(&link))
                .transpose()?;
            let page: CatalogPage = response.json().await?;
            repositories.extend(page.repositories);
        }

        tracing::debug!(endpoint = %self.transport.endpoint(), count = repositories.len(), "listed catalog");
        Ok(repositories)
    }

    pub async fn list_tags(&self, path: &str) -> Result<Vec<String>> {
        let first = format!("v2/{}/tags/list?n={}", path, PAGE_SIZE);
        let mut next = Some(self.transport.url(&first)?);
        let scope = repository_scope(path, "pull");
        let mut tags = Vec::new();
        let timeout = self.transport.request_timeout();

        while let Some(url) = next.take() {
            let response = self
                .transport
                .send(Some(&scope), "tag listing", |http| {
                    http.get(url.clone()).timeout(timeout)
                })
                .await?;

            if !response.status().is_success() {
                return Err(self.transport.error_for(response, "tag listing").await);
            }

            next = next_link(&response)
                .map(|link| self.transport.resolve(&link))
                .transpose()?;
            let page: TagsPage = response.json().await?;
            tags.extend(page.tags.unwrap_or_default());
        }

        tracing::debug!(repository = path, count = tags.len(), "listed tags");
        Ok(tags)
    }
}
