//! # Secret Sources
//!
//! Where decryption Secrets are read from. The controller reads them from the
//! cluster; tests and the CLI use an in-memory source.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;

/// Keyed byte blobs of one Secret
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Fetches Secret data by namespace and name
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Get the data of a Secret, or `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;
}

#[async_trait]
impl SecretSource for kube::Client {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let secrets: Api<Secret> = Api::namespaced(self.clone(), namespace);
        let secret = secrets
            .get_opt(name)
            .await
            .context(format!("Failed to get secret {namespace}/{name}"))?;

        Ok(secret.map(|secret| {
            let mut data: SecretData = secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect();
            // stringData is only set on objects that were never persisted, but merge it
            // like the API server would
            for (key, value) in secret.string_data.unwrap_or_default() {
                data.insert(key, value.into_bytes());
            }
            data
        }))
    }
}

/// In-memory Secrets keyed by `(namespace, name)`
#[derive(Debug, Clone, Default)]
pub struct StaticSecretSource {
    secrets: HashMap<(String, String), SecretData>,
}

impl StaticSecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a Secret
    #[must_use]
    pub fn with_secret(mut self, namespace: &str, name: &str, data: SecretData) -> Self {
        self.insert(namespace, name, data);
        self
    }

    pub fn insert(&mut self, namespace: &str, name: &str, data: SecretData) {
        self.secrets.insert((namespace.to_string(), name.to_string()), data);
    }
}

#[async_trait]
impl SecretSource for StaticSecretSource {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        Ok(self
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_lookup() {
        let source = StaticSecretSource::new().with_secret(
            "flux-system",
            "sops-keys",
            BTreeMap::from([("sops.vault-token".to_string(), b"token".to_vec())]),
        );
        let data = source.get_secret("flux-system", "sops-keys").await.unwrap().unwrap();
        assert_eq!(data["sops.vault-token"], b"token");
        assert!(source.get_secret("default", "sops-keys").await.unwrap().is_none());
    }
}
