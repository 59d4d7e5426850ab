//! # Credential Store
//!
//! Decryption material for one reconciliation attempt, imported from the
//! keys of a single Secret:
//!
//! | Secret key          | Backend                                  |
//! |---------------------|------------------------------------------|
//! | `*.asc`             | PGP private key (ASCII armored)          |
//! | `*.agekey`          | age identities, one per line             |
//! | `sops.vault-token`  | HashiCorp Vault token                    |
//! | `sops.aws-kms`      | AWS access key (YAML)                    |
//! | `sops.gcp-kms`      | GCP service account / authorized user    |
//! | `sops.azure-kv`     | Azure AD config (YAML or JSON)           |
//!
//! Keys are imported independently. A malformed entry is reported but does
//! not stop the other entries from being imported.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::age_keys::parse_identities;
use super::{AwsCredentials, AzureCredentials, GcpCredentials, PgpKeyring};
use crate::constants::{
    AGE_KEY_SUFFIX, AWS_KMS_KEY, AZURE_KV_KEY, GCP_KMS_KEY, PGP_KEY_SUFFIX, VAULT_TOKEN_KEY,
};
use crate::decryptor::error::{Backend, KeyImportError};
use crate::observability::metrics;

/// Imported decryption material. At most one credential per cloud backend is
/// active; an absent backend is simply not used.
#[derive(Default)]
pub struct CredentialStore {
    pub(crate) pgp: Option<PgpKeyring>,
    pub(crate) age: Vec<age::x25519::Identity>,
    pub(crate) vault_token: Option<Zeroizing<String>>,
    pub(crate) aws: Option<AwsCredentials>,
    pub(crate) gcp: Option<GcpCredentials>,
    pub(crate) azure: Option<AzureCredentials>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("pgp_keys", &self.pgp.as_ref().map_or(0, PgpKeyring::len))
            .field("age_identities", &self.age.len())
            .field("vault_token", &self.vault_token.is_some())
            .field("aws", &self.aws)
            .field("gcp", &self.gcp)
            .field("azure", &self.azure)
            .finish()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add age identities from `AGE-SECRET-KEY-1...` lines.
    /// Returns the number of identities added.
    ///
    /// # Errors
    ///
    /// Fails when a line is not a valid identity or no identity is present.
    pub fn add_age_identities(&mut self, text: &str) -> Result<usize, String> {
        let identities = parse_identities(text)?;
        let count = identities.len();
        self.age.extend(identities);
        Ok(count)
    }

    /// Add an ASCII-armored PGP private key
    ///
    /// # Errors
    ///
    /// Fails when the armor is not a private key block. The keyring is only
    /// created once a key was accepted.
    pub fn add_pgp_key(&mut self, armored: &str) -> Result<(), String> {
        match &mut self.pgp {
            Some(keyring) => keyring.add(armored),
            None => {
                let mut keyring = PgpKeyring::default();
                keyring.add(armored)?;
                self.pgp = Some(keyring);
                Ok(())
            }
        }
    }

    /// Whether any backend has material to work with
    pub fn is_empty(&self) -> bool {
        self.pgp.is_none()
            && self.age.is_empty()
            && self.vault_token.is_none()
            && self.aws.is_none()
            && self.gcp.is_none()
            && self.azure.is_none()
    }

    /// Import every recognized key of a decryption Secret.
    /// Unrecognized keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`KeyImportError::Invalid`] for a single malformed entry, or
    /// [`KeyImportError::Multiple`] listing every malformed entry. Entries
    /// that imported successfully stay configured either way.
    pub fn import_secret(
        &mut self,
        secret: &str,
        data: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), KeyImportError> {
        let mut errors = Vec::new();
        for (key, value) in data {
            let Some(backend) = backend_for_key(key) else {
                debug!(secret = %secret, key = %key, "ignoring unrecognized decryption Secret key");
                continue;
            };
            match self.import_entry(backend, value) {
                Ok(()) => {
                    debug!(
                        secret = %secret,
                        key = %key,
                        backend = backend.as_str(),
                        "imported decryption key"
                    );
                    metrics::increment_keys_imported(backend.as_str());
                }
                Err(reason) => {
                    warn!(
                        secret = %secret,
                        key = %key,
                        backend = backend.as_str(),
                        error = %reason,
                        "failed to import decryption key"
                    );
                    errors.push(KeyImportError::Invalid {
                        backend,
                        key: key.clone(),
                        secret: secret.to_string(),
                        reason,
                    });
                }
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(KeyImportError::Multiple(errors)),
        }
    }

    fn import_entry(&mut self, backend: Backend, value: &[u8]) -> Result<(), String> {
        match backend {
            Backend::Pgp => self.add_pgp_key(utf8(value)?),
            Backend::Age => self.add_age_identities(utf8(value)?).map(drop),
            Backend::HcVault => {
                self.vault_token = Some(Zeroizing::new(utf8(value)?.to_string()));
                Ok(())
            }
            Backend::AwsKms => {
                self.aws = Some(AwsCredentials::from_yaml(value)?);
                Ok(())
            }
            Backend::GcpKms => {
                self.gcp = Some(GcpCredentials::from_json(value)?);
                Ok(())
            }
            Backend::AzureKeyVault => {
                self.azure = Some(AzureCredentials::from_config(value)?);
                Ok(())
            }
        }
    }

    /// Fall back to ambient credentials for every cloud backend the Secret
    /// did not configure (workload identity, instance metadata, environment).
    pub fn set_auth_options(&mut self) {
        if self.aws.is_none() {
            self.aws = Some(AwsCredentials::Ambient);
        }
        if self.gcp.is_none() {
            self.gcp = Some(GcpCredentials::ambient());
        }
        if self.azure.is_none() {
            self.azure = Some(AzureCredentials::ambient());
        }
    }
}

fn backend_for_key(key: &str) -> Option<Backend> {
    match key {
        VAULT_TOKEN_KEY => Some(Backend::HcVault),
        AWS_KMS_KEY => Some(Backend::AwsKms),
        GCP_KMS_KEY => Some(Backend::GcpKms),
        AZURE_KV_KEY => Some(Backend::AzureKeyVault),
        _ if key.ends_with(PGP_KEY_SUFFIX) => Some(Backend::Pgp),
        _ if key.ends_with(AGE_KEY_SUFFIX) => Some(Backend::Age),
        _ => None,
    }
}

fn utf8(value: &[u8]) -> Result<&str, String> {
    std::str::from_utf8(value).map_err(|e| format!("value is not valid UTF-8: {e}"))
}
