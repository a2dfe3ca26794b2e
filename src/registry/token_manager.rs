//! Credential cache with proactive, single-flight refresh
//!
//! The [`AuthProvider`] keeps one slot per endpoint (and per scope for
//! issuers whose credentials are scoped). A slot is guarded by an async
//! mutex, so when a credential is missing or inside the refresh margin the
//! first caller issues a new one while concurrent callers wait and then
//! reuse it.

use crate::concurrency::retry::{Backoff, retry_with_backoff};
use crate::config::AuthConfig;
use crate::error::{ReplicationError, Result};
use crate::registry::auth::{
    Credential, GenericBearerIssuer, RegionScopedIssuer, SecretsTokenSource, TokenBasedIssuer,
    TokenIssuer,
};
use crate::registry::endpoint::{BackendKind, RegistryEndpoint};
use crate::secrets::SecretsProvider;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type Slot = Arc<Mutex<Option<Credential>>>;

pub struct AuthProvider {
    config: AuthConfig,
    issuers: HashMap<BackendKind, Arc<dyn TokenIssuer>>,
    slots: DashMap<String, Slot>,
}

impl AuthProvider {
    /// Provider without issuers; add them with [`with_issuer`](Self::with_issuer)
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            issuers: HashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Provider with the stock issuer for every backend kind, bootstrapping
    /// long-lived secrets from `secrets`
    pub fn standard(config: AuthConfig, http: Client, secrets: Arc<dyn SecretsProvider>) -> Self {
        let region = RegionScopedIssuer::new(
            Arc::new(SecretsTokenSource::new(Arc::clone(&secrets))),
            &config,
        );
        let token = TokenBasedIssuer::new(http.clone(), Arc::clone(&secrets));
        let generic = GenericBearerIssuer::new(http, secrets, &config);

        Self::new(config)
            .with_issuer(BackendKind::RegionScoped, Arc::new(region))
            .with_issuer(BackendKind::TokenBased, Arc::new(token))
            .with_issuer(BackendKind::GenericBearer, Arc::new(generic))
    }

    pub fn with_issuer(mut self, backend: BackendKind, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.issuers.insert(backend, issuer);
        self
    }

    /// Endpoint-wide credential
    pub async fn authenticate(&self, endpoint: &RegistryEndpoint) -> Result<Credential> {
        self.authenticate_scope(endpoint, None).await
    }

    /// Credential for `scope`, e.g. `repository:team/app:pull,push`
    pub async fn authenticate_scope(
        &self,
        endpoint: &RegistryEndpoint,
        scope: Option<&str>,
    ) -> Result<Credential> {
        let issuer = self.issuer(endpoint)?;
        let scope = scope.filter(|_| issuer.is_scoped());
        let key = slot_key(endpoint, scope);

        let slot = self.slots.entry(key.clone()).or_default().clone();
        let mut cached = slot.lock().await;

        if let Some(credential) = cached.as_ref() {
            if !credential.needs_refresh(Utc::now(), self.config.refresh_margin()) {
                return Ok(credential.clone());
            }
            tracing::debug!(slot = %key, "credential inside refresh margin");
        }

        let credential = self.issue_with_retry(issuer.as_ref(), endpoint, scope).await?;
        *cached = Some(credential.clone());
        Ok(credential)
    }

    /// Drop every cached credential for `endpoint`
    pub fn invalidate(&self, endpoint: &RegistryEndpoint) {
        let base = endpoint.key();
        let scoped_prefix = format!("{}|", base);
        self.slots
            .retain(|key, _| key != &base && !key.starts_with(&scoped_prefix));
        tracing::debug!(endpoint = %base, "invalidated credentials");
    }

    /// Drop the cached credential for a single scope
    pub fn invalidate_scope(&self, endpoint: &RegistryEndpoint, scope: Option<&str>) {
        let scoped = self
            .issuers
            .get(&endpoint.backend)
            .is_some_and(|issuer| issuer.is_scoped());
        self.slots
            .remove(&slot_key(endpoint, scope.filter(|_| scoped)));
    }

    fn issuer(&self, endpoint: &RegistryEndpoint) -> Result<Arc<dyn TokenIssuer>> {
        self.issuers.get(&endpoint.backend).cloned().ok_or_else(|| {
            ReplicationError::Configuration(format!(
                "no token issuer configured for {} endpoints",
                endpoint.backend
            ))
        })
    }

    async fn issue_with_retry(
        &self,
        issuer: &dyn TokenIssuer,
        endpoint: &RegistryEndpoint,
        scope: Option<&str>,
    ) -> Result<Credential> {
        let backoff = Backoff::from(&self.config.retry);
        let never = CancellationToken::new();

        let result = retry_with_backoff(&backoff, &never, "token issue", |attempt| async move {
            if attempt > 1 {
                tracing::info!(endpoint = %endpoint, attempt, "retrying credential issue");
            }
            issuer.issue(endpoint, scope).await
        })
        .await;

        match result {
            Ok(credential) => {
                tracing::debug!(endpoint = %endpoint, expires_at = ?credential.expires_at, "credential issued");
                Ok(credential)
            }
            Err(err) if err.is_retryable() => Err(ReplicationError::auth_fatal(
                endpoint.key(),
                format!(
                    "giving up after {} attempts: {}",
                    backoff.max_attempts, err
                ),
            )),
            Err(err) => Err(err),
        }
    }
}

fn slot_key(endpoint: &RegistryEndpoint, scope: Option<&str>) -> String {
    match scope {
        Some(scope) => format!("{}|{}", endpoint.key(), scope),
        None => endpoint.key(),
    }
}
