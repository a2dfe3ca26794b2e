//! Credentials and the token issuers that produce them
//!
//! Each [`BackendKind`](crate::registry::BackendKind) has one issuer:
//!
//! - [`RegionScopedIssuer`] decodes region-scoped authorization tokens
//!   (base64 `user:password`)
//! - [`TokenBasedIssuer`] exchanges an OAuth2 refresh token for an access token
//! - [`GenericBearerIssuer`] follows the `WWW-Authenticate` challenge of `/v2/`

use crate::config::AuthConfig;
use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{ReplicationError, Result};
use crate::registry::endpoint::RegistryEndpoint;
use crate::secrets::SecretsProvider;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Username registries expect alongside an OAuth2 access token
pub const OAUTH2_USERNAME: &str = "oauth2accesstoken";

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSecret {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
}

impl fmt::Debug for CredentialSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSecret::Anonymous => f.write_str("Anonymous"),
            CredentialSecret::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            CredentialSecret::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub secret: CredentialSecret,
    pub issued_at: DateTime<Utc>,
    /// `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn anonymous() -> Self {
        Self {
            secret: CredentialSecret::Anonymous,
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn basic(
        username: impl Into<String>,
        password: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            secret: CredentialSecret::Basic {
                username: username.into(),
                password: password.into(),
            },
            issued_at: Utc::now(),
            expires_at,
        }
    }

    pub fn bearer(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: CredentialSecret::Bearer(token.into()),
            issued_at: Utc::now(),
            expires_at,
        }
    }

    /// True once `now` is within the refresh margin of expiry. The margin
    /// never exceeds half the credential's lifetime, so short-lived tokens
    /// are reused for the first half of their life.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let margin = ChronoDuration::from_std(margin).unwrap_or(ChronoDuration::MAX);
                let half_life = (expires_at - self.issued_at) / 2;
                let margin = margin.min(half_life.max(ChronoDuration::zero()));
                now.checked_add_signed(margin)
                    .is_none_or(|deadline| deadline >= expires_at)
            }
            None => false,
        }
    }

    /// Attach the credential to an outgoing request
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.secret {
            CredentialSecret::Anonymous => request,
            CredentialSecret::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            CredentialSecret::Bearer(token) => request.bearer_auth(token),
        }
    }
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Produce a fresh credential for `endpoint`. `scope` is the
    /// distribution token scope the caller is about to use, if any.
    async fn issue(&self, endpoint: &RegistryEndpoint, scope: Option<&str>) -> Result<Credential>;

    /// Whether credentials differ per requested scope
    fn is_scoped(&self) -> bool {
        false
    }
}

/// Parsed `WWW-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl AuthChallenge {
    /// Parse `Bearer realm="...",service="...",scope="..."` or `Basic realm="..."`.
    /// Quoted values may contain commas.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(AuthChallenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = parse_challenge_params(params);
        let get = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        };

        Some(AuthChallenge::Bearer {
            realm: get("realm")?,
            service: get("service"),
            scope: get("scope"),
        })
    }
}

fn parse_challenge_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let value = quoted[..end].to_string();
            rest = quoted.get(end + 1..).unwrap_or("");
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        params.push((key, value));
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_token(self, endpoint: &str) -> Result<(String, Option<u64>)> {
        let expires_in = self.expires_in;
        self.token
            .or(self.access_token)
            .filter(|token| !token.is_empty())
            .map(|token| (token, expires_in))
            .ok_or_else(|| ReplicationError::auth_fatal(endpoint, "token response carried no token"))
    }
}

fn expiry_after(seconds: u64) -> Option<DateTime<Utc>> {
    i64::try_from(seconds)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
}

async fn read_token_response(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<(String, Option<u64>)> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        return Err(HttpErrorHandler::handle_auth_error(status, &error_text, endpoint));
    }

    let body: TokenResponse = response.json().await.map_err(|e| {
        ReplicationError::auth_fatal(endpoint, format!("malformed token response: {}", e))
    })?;
    body.into_token(endpoint)
}

/// Encoded authorization token for one region
#[derive(Debug, Clone)]
pub struct AuthorizationToken {
    /// base64 `user:password`
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Source of region-scoped authorization tokens, usually a cloud SDK call
#[async_trait]
pub trait AuthorizationTokenSource: Send + Sync {
    async fn authorization_token(&self, region: &str) -> Result<AuthorizationToken>;
}

/// Reads the encoded token through the secrets collaborator under
/// `(provider = "region", key = <region>)`
pub struct SecretsTokenSource {
    secrets: Arc<dyn SecretsProvider>,
}

impl SecretsTokenSource {
    pub fn new(secrets: Arc<dyn SecretsProvider>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl AuthorizationTokenSource for SecretsTokenSource {
    async fn authorization_token(&self, region: &str) -> Result<AuthorizationToken> {
        let secret = self.secrets.get_credential("region", region).await?;
        Ok(AuthorizationToken {
            token: secret.expose().to_string(),
            expires_at: None,
        })
    }
}

pub struct RegionScopedIssuer {
    source: Arc<dyn AuthorizationTokenSource>,
    default_lifetime_secs: u64,
}

impl RegionScopedIssuer {
    pub fn new(source: Arc<dyn AuthorizationTokenSource>, config: &AuthConfig) -> Self {
        Self {
            source,
            default_lifetime_secs: config.region_token_lifetime_secs,
        }
    }

    fn decode(endpoint: &str, token: &str) -> Result<(String, String)> {
        let decoded = BASE64.decode(token.trim()).map_err(|e| {
            ReplicationError::auth_fatal(endpoint, format!("authorization token is not base64: {}", e))
        })?;
        let decoded = String::from_utf8(decoded).map_err(|_| {
            ReplicationError::auth_fatal(endpoint, "authorization token is not UTF-8")
        })?;
        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            ReplicationError::auth_fatal(endpoint, "authorization token is not user:password")
        })?;
        Ok((username.to_string(), password.to_string()))
    }
}

#[async_trait]
impl TokenIssuer for RegionScopedIssuer {
    async fn issue(&self, endpoint: &RegistryEndpoint, _scope: Option<&str>) -> Result<Credential> {
        let key = endpoint.key();
        let region = endpoint.region.as_deref().ok_or_else(|| {
            ReplicationError::auth_fatal(&key, "region-scoped endpoint has no region")
        })?;

        let token = self.source.authorization_token(region).await?;
        let (username, password) = Self::decode(&key, &token.token)?;
        let expires_at = token
            .expires_at
            .or_else(|| expiry_after(self.default_lifetime_secs));

        tracing::debug!(endpoint = %key, region, "issued region-scoped credential");
        Ok(Credential::basic(username, password, expires_at))
    }
}

/// Bootstrap document for the refresh-token exchange
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthBootstrap {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

pub struct TokenBasedIssuer {
    http: Client,
    secrets: Arc<dyn SecretsProvider>,
}

impl TokenBasedIssuer {
    pub fn new(http: Client, secrets: Arc<dyn SecretsProvider>) -> Self {
        Self { http, secrets }
    }

    async fn bootstrap(&self, endpoint: &RegistryEndpoint) -> Result<OAuthBootstrap> {
        let secret = self.secrets.get_credential("oauth", &endpoint.host).await?;
        serde_json::from_str(secret.expose()).map_err(|e| {
            ReplicationError::auth_fatal(endpoint.key(), format!("invalid OAuth bootstrap: {}", e))
        })
    }
}

#[async_trait]
impl TokenIssuer for TokenBasedIssuer {
    async fn issue(&self, endpoint: &RegistryEndpoint, _scope: Option<&str>) -> Result<Credential> {
        let key = endpoint.key();
        let bootstrap = self.bootstrap(endpoint).await?;
        let token_uri = bootstrap.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("client_id", &bootstrap.client_id)
            .append_pair("client_secret", &bootstrap.client_secret)
            .append_pair("refresh_token", &bootstrap.refresh_token)
            .finish();

        let response = self
            .http
            .post(token_uri)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                ReplicationError::auth_retryable(
                    &key,
                    NetworkErrorHandler::handle_network_error(&e, "token exchange").to_string(),
                )
            })?;

        let (access_token, expires_in) = read_token_response(response, &key).await?;
        tracing::debug!(endpoint = %key, expires_in, "exchanged refresh token");
        Ok(Credential::basic(
            OAUTH2_USERNAME,
            access_token,
            expiry_after(expires_in.unwrap_or(3600)),
        ))
    }
}

pub struct GenericBearerIssuer {
    http: Client,
    secrets: Arc<dyn SecretsProvider>,
    default_lifetime_secs: u64,
}

impl GenericBearerIssuer {
    pub fn new(http: Client, secrets: Arc<dyn SecretsProvider>, config: &AuthConfig) -> Self {
        Self {
            http,
            secrets,
            default_lifetime_secs: config.bearer_token_lifetime_secs,
        }
    }

    /// `username:password` stored under `(provider = "generic", key = <host>)`
    async fn basic_credentials(&self, endpoint: &RegistryEndpoint) -> Option<(String, String)> {
        let secret = self.secrets.get_credential("generic", &endpoint.host).await.ok()?;
        secret
            .expose()
            .split_once(':')
            .map(|(user, password)| (user.to_string(), password.to_string()))
    }

    async fn challenge(&self, endpoint: &RegistryEndpoint) -> Result<Option<AuthChallenge>> {
        let key = endpoint.key();
        let url = endpoint.base_url()?.join("v2/")?;
        let response = self.http.get(url).send().await.map_err(|e| {
            ReplicationError::auth_retryable(
                &key,
                NetworkErrorHandler::handle_network_error(&e, "auth challenge").to_string(),
            )
        })?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                let header = response
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        ReplicationError::auth_fatal(&key, "401 without WWW-Authenticate header")
                    })?;
                AuthChallenge::parse(header).map(Some).ok_or_else(|| {
                    ReplicationError::auth_fatal(&key, format!("unsupported challenge: {}", header))
                })
            }
            status if status.is_success() => Ok(None),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(HttpErrorHandler::handle_auth_error(status, &text, &key))
            }
        }
    }
}

#[async_trait]
impl TokenIssuer for GenericBearerIssuer {
    async fn issue(&self, endpoint: &RegistryEndpoint, scope: Option<&str>) -> Result<Credential> {
        let key = endpoint.key();

        match self.challenge(endpoint).await? {
            None => {
                tracing::debug!(endpoint = %key, "registry does not require authentication");
                Ok(Credential::anonymous())
            }
            Some(AuthChallenge::Basic) => {
                let (username, password) = self.basic_credentials(endpoint).await.ok_or_else(|| {
                    ReplicationError::auth_fatal(&key, "basic challenge but no credentials configured")
                })?;
                Ok(Credential::basic(username, password, None))
            }
            Some(AuthChallenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            }) => {
                let mut url = url::Url::parse(&realm).map_err(|e| {
                    ReplicationError::auth_fatal(&key, format!("invalid token realm {}: {}", realm, e))
                })?;
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(service) = &service {
                        query.append_pair("service", service);
                    }
                    for scope in scope.into_iter().chain(challenge_scope.as_deref()) {
                        query.append_pair("scope", scope);
                    }
                }

                let mut request = self.http.get(url);
                if let Some((username, password)) = self.basic_credentials(endpoint).await {
                    request = request.basic_auth(username, Some(password));
                }

                let response = request.send().await.map_err(|e| {
                    ReplicationError::auth_retryable(
                        &key,
                        NetworkErrorHandler::handle_network_error(&e, "token request").to_string(),
                    )
                })?;

                let (token, expires_in) = read_token_response(response, &key).await?;
                tracing::debug!(endpoint = %key, scope, expires_in, "obtained bearer token");
                Ok(Credential::bearer(
                    token,
                    expiry_after(expires_in.unwrap_or(self.default_lifetime_secs)),
                ))
            }
        }
    }

    fn is_scoped(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecretsProvider;

    #[test]
    fn test_parse_bearer_challenge_with_commas() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example/token",service="registry.example",scope="repository:team/app:pull,push""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            AuthChallenge::Bearer {
                realm: "https://auth.example/token".into(),
                service: Some("registry.example".into()),
                scope: Some("repository:team/app:pull,push".into()),
            }
        );
    }

    #[test]
    fn test_parse_basic_and_unknown_challenges() {
        assert_eq!(AuthChallenge::parse(r#"Basic realm="x""#), Some(AuthChallenge::Basic));
        assert_eq!(AuthChallenge::parse("Negotiate"), None);
        assert_eq!(AuthChallenge::parse(r#"Bearer service="no-realm""#), None);
    }

    #[test]
    fn test_needs_refresh_within_margin() {
        let now = Utc::now();
        let mut credential = Credential::bearer("t", Some(now + ChronoDuration::seconds(600)));
        credential.issued_at = now;
        assert!(!credential.needs_refresh(now, Duration::from_secs(120)));
        assert!(credential.needs_refresh(now + ChronoDuration::seconds(500), Duration::from_secs(120)));
        assert!(!Credential::anonymous().needs_refresh(now, Duration::from_secs(3600)));
    }

    #[test]
    fn test_margin_is_capped_at_half_the_lifetime() {
        let now = Utc::now();
        let mut credential = Credential::bearer("t", Some(now + ChronoDuration::seconds(60)));
        credential.issued_at = now;
        let margin = Duration::from_secs(300);
        assert!(!credential.needs_refresh(now, margin));
        assert!(!credential.needs_refresh(now + ChronoDuration::seconds(29), margin));
        assert!(credential.needs_refresh(now + ChronoDuration::seconds(30), margin));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let basic = format!("{:?}", Credential::basic("user", "hunter2", None));
        assert!(basic.contains("user"));
        assert!(!basic.contains("hunter2"));
        assert!(!format!("{:?}", Credential::bearer("abc.def", None)).contains("abc.def"));
    }

    #[tokio::test]
    async fn test_region_scoped_decodes_token() {
        let secrets = StaticSecretsProvider::new().with_secret(
            "region",
            "eu-west-1",
            BASE64.encode("AWS:s3cr3t"),
        );
        let issuer = RegionScopedIssuer::new(
            Arc::new(SecretsTokenSource::new(Arc::new(secrets))),
            &AuthConfig::default(),
        );
        let endpoint = RegistryEndpoint::region_scoped("123.registry.cloud", "eu-west-1");

        let credential = issuer.issue(&endpoint, None).await.unwrap();
        assert_eq!(
            credential.secret,
            CredentialSecret::Basic {
                username: "AWS".into(),
                password: "s3cr3t".into()
            }
        );
        let lifetime = credential.expires_at.unwrap() - Utc::now();
        assert!(lifetime > ChronoDuration::hours(11));
    }

    #[tokio::test]
    async fn test_region_scoped_rejects_garbage() {
        let secrets = StaticSecretsProvider::new().with_secret("region", "eu-west-1", "%%%");
        let issuer = RegionScopedIssuer::new(
            Arc::new(SecretsTokenSource::new(Arc::new(secrets))),
            &AuthConfig::default(),
        );
        let endpoint = RegistryEndpoint::region_scoped("123.registry.cloud", "eu-west-1");
        let err = issuer.issue(&endpoint, None).await.unwrap_err();
        assert!(err.aborts_run());
    }
}
