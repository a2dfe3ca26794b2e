//! Authenticated HTTP transport for one registry endpoint
//!
//! Every request goes out with the credential the [`AuthProvider`] holds
//! for the endpoint and scope. A `401` on a replayable request invalidates
//! the cached credential and retries once with a fresh one.

use crate::config::HttpConfig;
use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{ReplicationError, Result};
use crate::registry::endpoint::RegistryEndpoint;
use crate::registry::token_manager::AuthProvider;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Token scope for repository operations, e.g. `repository:team/app:pull`
pub fn repository_scope(path: &str, actions: &str) -> String {
    format!("repository:{}:{}", path, actions)
}

pub const CATALOG_SCOPE: &str = "registry:catalog:*";

pub struct RegistryTransport {
    http: Client,
    endpoint: RegistryEndpoint,
    base_url: Url,
    auth: Arc<AuthProvider>,
    request_timeout: Duration,
}

impl RegistryTransport {
    pub fn new(
        http: Client,
        endpoint: RegistryEndpoint,
        auth: Arc<AuthProvider>,
        config: &HttpConfig,
    ) -> Result<Self> {
        let base_url = endpoint.base_url()?;
        Ok(Self {
            http,
            endpoint,
            base_url,
            auth,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Build the shared HTTP client. No overall timeout is set so large
    /// blob streams are not cut off; metadata calls use [`request_timeout`](Self::request_timeout).
    pub fn http_client(config: &HttpConfig, insecure: bool) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone());
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder
            .build()
            .map_err(|e| ReplicationError::Configuration(format!("failed to create HTTP client: {}", e)))
    }

    pub fn endpoint(&self) -> &RegistryEndpoint {
        &self.endpoint
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// URL for an API path relative to the registry root, e.g. `v2/_catalog`
    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Resolve a `Location` or `Link` target, absolute or relative
    pub fn resolve(&self, location: &str) -> Result<Url> {
        Ok(self.base_url.join(location)?)
    }

    /// Send a replayable request, refreshing the credential once on `401`
    pub async fn send<F>(&self, scope: Option<&str>, operation: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.send_authenticated(scope, operation, &build).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!(
            endpoint = %self.endpoint,
            operation,
            "received 401, refreshing credential"
        );
        self.auth.invalidate_scope(&self.endpoint, scope);
        self.send_authenticated(scope, operation, &build).await
    }

    /// Send a request whose body cannot be replayed. A `401` invalidates the
    /// credential and surfaces as a retryable auth error so the caller can
    /// start over with a fresh body.
    pub async fn send_once(
        &self,
        scope: Option<&str>,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<Response> {
        let credential = self.auth.authenticate_scope(&self.endpoint, scope).await?;
        let response = credential
            .apply(request)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, operation))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.auth.invalidate_scope(&self.endpoint, scope);
            return Err(ReplicationError::auth_retryable(
                self.endpoint.key(),
                format!("credential rejected during {}", operation),
            ));
        }
        Ok(response)
    }

    async fn send_authenticated<F>(
        &self,
        scope: Option<&str>,
        operation: &str,
        build: &F,
    ) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let credential = self.auth.authenticate_scope(&self.endpoint, scope).await?;
        credential
            .apply(build(&self.http))
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, operation))
    }

    /// Consume a failed response into the matching error
    pub async fn error_for(&self, response: Response, operation: &str) -> ReplicationError {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        HttpErrorHandler::handle_registry_error(status, &error_text, operation, &self.endpoint.host)
    }
}

/// Target of a `Link: <...>; rel="next"` pagination header
pub fn next_link(response: &Response) -> Option<String> {
    let header = response.headers().get(reqwest::header::LINK)?.to_str().ok()?;
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        params
            .contains("rel=\"next\"")
            .then(|| target.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    })
}
