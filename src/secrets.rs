//! Secrets collaborator used to bootstrap long-lived credentials
//!
//! Only token issuers call into this interface. Cloud secret store clients
//! live outside the crate and implement [`SecretsProvider`].

use crate::error::{ReplicationError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::env;
use std::fmt;

/// Secret material; `Debug` never prints the value
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn get_credential(&self, provider: &str, key: &str) -> Result<SecretValue>;
}

/// Reads `REPLICATOR_SECRET_<PROVIDER>_<KEY>` environment variables.
///
/// Non-alphanumeric characters in provider and key become `_`.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretsProvider;

impl EnvSecretsProvider {
    pub fn variable_name(provider: &str, key: &str) -> String {
        let sanitize = |s: &str| {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect::<String>()
        };
        format!("REPLICATOR_SECRET_{}_{}", sanitize(provider), sanitize(key))
    }
}

#[async_trait]
impl SecretsProvider for EnvSecretsProvider {
    async fn get_credential(&self, provider: &str, key: &str) -> Result<SecretValue> {
        let name = Self::variable_name(provider, key);
        env::var(&name)
            .map(SecretValue::new)
            .map_err(|_| ReplicationError::auth_fatal(provider, format!("secret {} is not set", name)))
    }
}

/// Fixed in-memory secrets, keyed by `(provider, key)`
#[derive(Debug, Default, Clone)]
pub struct StaticSecretsProvider {
    secrets: HashMap<(String, String), SecretValue>,
}

impl StaticSecretsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(
        mut self,
        provider: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.secrets
            .insert((provider.into(), key.into()), SecretValue::new(value));
        self
    }
}

#[async_trait]
impl SecretsProvider for StaticSecretsProvider {
    async fn get_credential(&self, provider: &str, key: &str) -> Result<SecretValue> {
        self.secrets
            .get(&(provider.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                ReplicationError::auth_fatal(provider, format!("no secret stored for key {}", key))
            })
    }
}
