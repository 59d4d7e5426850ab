//! # Master Keys
//!
//! A SOPS document seals its data key once per master key. Each backend is a
//! variant of [`MasterKey`] carrying the stanza from the document's metadata,
//! and knows whether the imported credentials can open it.
//!
//! Network-backed unsealing (Vault, AWS, GCP, Azure) runs under an
//! [`UnsealContext`] that bounds every call by the configured timeout and
//! aborts it when the reconciliation attempt is cancelled.

mod age_keys;
mod aws_kms;
mod azure_kv;
mod gcp_kms;
mod hc_vault;
mod http;
mod pgp;
pub mod source;
pub mod store;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use self::age_keys::AgeKey;
pub use self::aws_kms::{AwsCredentials, AwsKmsKey};
pub use self::azure_kv::{AzureCredentials, AzureKvKey};
pub use self::gcp_kms::{GcpCredentials, GcpKmsKey};
pub use self::hc_vault::VaultKey;
pub use self::pgp::{PgpKey, PgpKeyring};
pub use self::source::{SecretSource, StaticSecretSource};
pub use self::store::CredentialStore;

use super::error::{Backend, SopsError, UnsealError};
use super::sops::{DataKey, Metadata};
use crate::config::DecryptorConfig;

/// One sealed copy of the data key, as listed in the document metadata
#[derive(Debug, Clone, PartialEq)]
pub enum MasterKey {
    Pgp(PgpKey),
    Age(AgeKey),
    HcVault(VaultKey),
    AwsKms(AwsKmsKey),
    GcpKms(GcpKmsKey),
    AzureKeyVault(AzureKvKey),
}

impl MasterKey {
    pub fn backend(&self) -> Backend {
        match self {
            MasterKey::Pgp(_) => Backend::Pgp,
            MasterKey::Age(_) => Backend::Age,
            MasterKey::HcVault(_) => Backend::HcVault,
            MasterKey::AwsKms(_) => Backend::AwsKms,
            MasterKey::GcpKms(_) => Backend::GcpKms,
            MasterKey::AzureKeyVault(_) => Backend::AzureKeyVault,
        }
    }

    /// Whether the imported credentials could open this key
    pub fn can_unseal(&self, credentials: &CredentialStore) -> bool {
        match self {
            MasterKey::Pgp(_) => credentials.pgp.is_some(),
            MasterKey::Age(key) => key.matches_any(&credentials.age),
            MasterKey::HcVault(_) => credentials.vault_token.is_some(),
            MasterKey::AwsKms(_) => credentials.aws.is_some(),
            MasterKey::GcpKms(_) => credentials.gcp.is_some(),
            MasterKey::AzureKeyVault(_) => credentials.azure.is_some(),
        }
    }

    /// Recover the data key
    ///
    /// # Errors
    ///
    /// Returns [`UnsealError`] when credentials are missing, the backend
    /// refuses, the call times out, or the attempt is cancelled.
    pub async fn unseal(
        &self,
        credentials: &CredentialStore,
        ctx: &UnsealContext,
    ) -> Result<DataKey, UnsealError> {
        let backend = self.backend();
        let bytes = ctx
            .guard(backend, async {
                match self {
                    MasterKey::Pgp(key) => {
                        let keyring = credentials
                            .pgp
                            .as_ref()
                            .ok_or(UnsealError::NotConfigured(backend))?;
                        keyring.decrypt(key, ctx).await
                    }
                    MasterKey::Age(key) => key.unseal(&credentials.age),
                    MasterKey::HcVault(key) => {
                        let token = credentials
                            .vault_token
                            .as_ref()
                            .ok_or(UnsealError::NotConfigured(backend))?;
                        key.unseal(token, ctx).await
                    }
                    MasterKey::AwsKms(key) => {
                        let creds = credentials
                            .aws
                            .as_ref()
                            .ok_or(UnsealError::NotConfigured(backend))?;
                        key.unseal(creds).await
                    }
                    MasterKey::GcpKms(key) => {
                        let creds = credentials
                            .gcp
                            .as_ref()
                            .ok_or(UnsealError::NotConfigured(backend))?;
                        key.unseal(creds, ctx).await
                    }
                    MasterKey::AzureKeyVault(key) => {
                        let creds = credentials
                            .azure
                            .as_ref()
                            .ok_or(UnsealError::NotConfigured(backend))?;
                        key.unseal(creds, ctx).await
                    }
                }
            })
            .await?;
        DataKey::from_bytes(bytes).map_err(|reason| UnsealError::failed(backend, reason))
    }

    /// Seal `key` into a copy of this stanza. Only age seals locally.
    ///
    /// # Errors
    ///
    /// Returns [`SopsError::Unsupported`] for backends that need a remote
    /// service to seal, or [`SopsError::Seal`] when age encryption fails.
    pub fn seal(&self, key: &DataKey) -> Result<MasterKey, SopsError> {
        match self {
            MasterKey::Age(age) => age.seal(key).map(MasterKey::Age),
            other => Err(SopsError::Unsupported(format!(
                "sealing data keys with {} is not supported",
                other.backend()
            ))),
        }
    }
}

/// Bounds for unsealing calls made during one reconciliation attempt
#[derive(Debug, Clone)]
pub struct UnsealContext {
    pub cancel: CancellationToken,
    pub timeout: Duration,
    pub http: reqwest::Client,
    pub gpg_binary: PathBuf,
}

impl Default for UnsealContext {
    fn default() -> Self {
        Self::new(&DecryptorConfig::default())
    }
}

impl UnsealContext {
    pub fn new(config: &DecryptorConfig) -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeout: config.unseal_timeout(),
            http: reqwest::Client::new(),
            gpg_binary: PathBuf::from(&config.gpg_binary),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `fut`, failing on timeout or cancellation.
    /// Cancellation wins when both are ready.
    pub(crate) async fn guard<T, F>(&self, backend: Backend, fut: F) -> Result<T, UnsealError>
    where
        F: Future<Output = Result<T, UnsealError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(UnsealError::Cancelled),
            result = tokio::time::timeout(self.timeout, fut) => {
                result.unwrap_or(Err(UnsealError::Timeout {
                    backend,
                    secs: self.timeout.as_secs(),
                }))
            }
        }
    }
}

/// Unseal the data key with the first key a configured backend can open.
///
/// Groups are tried in order, and keys in order within a group. Failures are
/// collected so the final error lists why each candidate did not work.
///
/// # Errors
///
/// Returns [`SopsError::DataKey`] when no key could be unsealed, or
/// [`SopsError::Cancelled`] as soon as the attempt is cancelled.
pub async fn unseal_data_key(
    metadata: &Metadata,
    credentials: &CredentialStore,
    ctx: &UnsealContext,
) -> Result<DataKey, SopsError> {
    let mut reasons = Vec::new();
    for (index, group) in metadata.key_groups.iter().enumerate() {
        for key in &group.keys {
            let backend = key.backend();
            if !key.can_unseal(credentials) {
                reasons.push(format!("key group {index}: {}", UnsealError::NotConfigured(backend)));
                continue;
            }
            match key.unseal(credentials, ctx).await {
                Ok(data_key) => {
                    debug!(backend = backend.as_str(), group = index, "unsealed data key");
                    return Ok(data_key);
                }
                Err(UnsealError::Cancelled) => return Err(SopsError::Cancelled),
                Err(err) => {
                    debug!(
                        backend = backend.as_str(),
                        group = index,
                        error = %err,
                        "failed to unseal data key"
                    );
                    reasons.push(format!("key group {index}: {err}"));
                }
            }
        }
    }
    if reasons.is_empty() {
        reasons.push("no key groups in sops metadata".to_string());
    }
    Err(SopsError::DataKey(reasons))
}
