//! # Azure Key Vault Master Keys
//!
//! The data key is wrapped with an RSA key in Key Vault and unwrapped with
//! `POST {vault_url}/keys/{name}/{version}/unwrapkey` (RSA-OAEP-256).
//!
//! The `sops.azure-kv` Secret entry is a YAML or JSON document:
//!
//! ```yaml
//! tenantId: <tenant>
//! clientId: <application id>
//! clientSecret: <secret>
//! ```
//!
//! A `clientId` alone selects a user-assigned managed identity. Without an
//! entry, credentials are taken from the environment: workload identity
//! (`AZURE_FEDERATED_TOKEN_FILE`), a client secret (`AZURE_CLIENT_SECRET`),
//! then the instance metadata service.

use std::fmt;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::http::{send_json, unseal_error, TokenCache, TokenResponse};
use super::UnsealContext;
use crate::constants::{
    AZURE_AUTHORITY_HOST, AZURE_IMDS_TOKEN_URL, AZURE_KEY_VAULT_API_VERSION, AZURE_VAULT_SCOPE,
};
use crate::decryptor::error::{Backend, UnsealError};

const IMDS_API_VERSION: &str = "2018-02-01";
const IMDS_RESOURCE: &str = "https://vault.azure.net";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// `azure_kv` entry of SOPS metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureKvKey {
    #[serde(default)]
    pub vault_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub enc: String,
}

enum TokenSource {
    ClientSecret {
        authority: String,
        tenant_id: String,
        client_id: String,
        client_secret: Zeroizing<String>,
    },
    WorkloadIdentity {
        authority: String,
        tenant_id: String,
        client_id: String,
        token_file: PathBuf,
    },
    ManagedIdentity {
        client_id: Option<String>,
    },
    Ambient,
}

/// Credentials used to call Key Vault
pub struct AzureCredentials {
    source: TokenSource,
    cache: TokenCache,
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.source {
            TokenSource::ClientSecret { client_id, .. } => format!("ClientSecret({client_id})"),
            TokenSource::WorkloadIdentity { client_id, .. } => {
                format!("WorkloadIdentity({client_id})")
            }
            TokenSource::ManagedIdentity { client_id } => {
                format!("ManagedIdentity({})", client_id.as_deref().unwrap_or("system"))
            }
            TokenSource::Ambient => "Ambient".to_string(),
        };
        f.debug_struct("AzureCredentials").field("source", &kind).finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AadConfig {
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    client_certificate: String,
    #[serde(default)]
    authority_host: String,
}

#[derive(Serialize)]
struct UnwrapRequest<'a> {
    alg: &'a str,
    value: &'a str,
}

#[derive(Deserialize)]
struct UnwrapResponse {
    value: String,
}

impl AzureCredentials {
    /// Parse a `sops.azure-kv` entry.
    ///
    /// # Errors
    ///
    /// Fails when the document is not YAML or JSON, or when it names no
    /// supported way of obtaining a token.
    pub fn from_config(data: &[u8]) -> Result<Self, String> {
        // YAML is a superset of JSON
        let config: AadConfig =
            serde_yaml::from_slice(data).map_err(|e| format!("failed to parse AAD config: {e}"))?;
        let authority = if config.authority_host.is_empty() {
            AZURE_AUTHORITY_HOST.to_string()
        } else {
            config.authority_host.trim_end_matches('/').to_string()
        };

        let source = match (
            config.tenant_id.is_empty(),
            config.client_id.is_empty(),
            config.client_secret.is_empty(),
        ) {
            (false, false, false) => TokenSource::ClientSecret {
                authority,
                tenant_id: config.tenant_id,
                client_id: config.client_id,
                client_secret: Zeroizing::new(config.client_secret),
            },
            (true, false, true) if config.client_certificate.is_empty() => {
                TokenSource::ManagedIdentity {
                    client_id: Some(config.client_id),
                }
            }
            _ => {
                return Err("unsupported config: requires 'tenantId', 'clientId' and \
                     'clientSecret', or a managed identity 'clientId'"
                    .to_string())
            }
        };
        Ok(Self {
            source,
            cache: TokenCache::default(),
        })
    }

    /// Credentials resolved from the environment when a token is needed
    pub fn ambient() -> Self {
        Self {
            source: TokenSource::Ambient,
            cache: TokenCache::default(),
        }
    }

    async fn access_token(&self, http: &reqwest::Client) -> anyhow::Result<Zeroizing<String>> {
        self.cache
            .get_or_fetch(|| async {
                match &self.source {
                    TokenSource::Ambient => fetch_token(&source_from_env(), http).await,
                    source => fetch_token(source, http).await,
                }
            })
            .await
    }
}

/// Resolve the ambient credential chain from `AZURE_*` variables
fn source_from_env() -> TokenSource {
    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    let authority = var("AZURE_AUTHORITY_HOST")
        .map(|host| host.trim_end_matches('/').to_string())
        .unwrap_or_else(|| AZURE_AUTHORITY_HOST.to_string());
    let tenant_id = var("AZURE_TENANT_ID");
    let client_id = var("AZURE_CLIENT_ID");

    match (tenant_id, client_id) {
        (Some(tenant_id), Some(client_id)) => {
            if let Some(token_file) = var("AZURE_FEDERATED_TOKEN_FILE") {
                TokenSource::WorkloadIdentity {
                    authority,
                    tenant_id,
                    client_id,
                    token_file: PathBuf::from(token_file),
                }
            } else if let Some(secret) = var("AZURE_CLIENT_SECRET") {
                TokenSource::ClientSecret {
                    authority,
                    tenant_id,
                    client_id,
                    client_secret: Zeroizing::new(secret),
                }
            } else {
                TokenSource::ManagedIdentity {
                    client_id: Some(client_id),
                }
            }
        }
        (_, client_id) => TokenSource::ManagedIdentity { client_id },
    }
}

async fn fetch_token(
    source: &TokenSource,
    http: &reqwest::Client,
) -> anyhow::Result<TokenResponse> {
    match source {
        TokenSource::ClientSecret {
            authority,
            tenant_id,
            client_id,
            client_secret,
        } => {
            let form = [
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", AZURE_VAULT_SCOPE),
            ];
            send_json(http.post(token_url(authority, tenant_id)).form(&form)).await
        }
        TokenSource::WorkloadIdentity {
            authority,
            tenant_id,
            client_id,
            token_file,
        } => {
            let assertion = Zeroizing::new(
                tokio::fs::read_to_string(token_file)
                    .await
                    .with_context(|| {
                        format!("failed to read federated token '{}'", token_file.display())
                    })?,
            );
            let form = [
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                ("client_assertion", assertion.trim()),
                ("scope", AZURE_VAULT_SCOPE),
            ];
            send_json(http.post(token_url(authority, tenant_id)).form(&form)).await
        }
        TokenSource::ManagedIdentity { client_id } => {
            let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", IMDS_RESOURCE)];
            if let Some(client_id) = client_id {
                query.push(("client_id", client_id.as_str()));
            }
            send_json(http.get(AZURE_IMDS_TOKEN_URL).query(&query).header("Metadata", "true")).await
        }
        TokenSource::Ambient => Err(anyhow!(
            "ambient credentials must be resolved before fetching a token"
        )),
    }
}

fn token_url(authority: &str, tenant_id: &str) -> String {
    format!("{authority}/{tenant_id}/oauth2/v2.0/token")
}

impl AzureKvKey {
    /// `{vault_url}/keys/{name}/{version}/unwrapkey?api-version=...`
    fn unwrap_url(&self) -> String {
        format!(
            "{}/keys/{}/{}/unwrapkey?api-version={AZURE_KEY_VAULT_API_VERSION}",
            self.vault_url.trim_end_matches('/'),
            self.name,
            self.version
        )
    }

    pub(crate) async fn unseal(
        &self,
        credentials: &AzureCredentials,
        ctx: &UnsealContext,
    ) -> Result<Vec<u8>, UnsealError> {
        if self.vault_url.is_empty() || self.name.is_empty() {
            return Err(UnsealError::failed(
                Backend::AzureKeyVault,
                "key is missing vault_url or name",
            ));
        }
        let token = credentials
            .access_token(&ctx.http)
            .await
            .map_err(unseal_error(Backend::AzureKeyVault))?;
        let request = ctx
            .http
            .post(self.unwrap_url())
            .bearer_auth(token.as_str())
            .json(&UnwrapRequest {
                alg: "RSA-OAEP-256",
                value: &self.enc,
            });
        let response: UnwrapResponse = send_json(request)
            .await
            .map_err(unseal_error(Backend::AzureKeyVault))?;
        let value = Zeroizing::new(response.value);
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(value.trim_end_matches('='))
            .map_err(|e| {
                UnsealError::failed(
                    Backend::AzureKeyVault,
                    format!("invalid base64 in response: {e}"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_secret_config() {
        let creds = AzureCredentials::from_config(
            b"tenantId: some-tenant-id\nclientId: some-client-id\nclientSecret: some-client-secret\n",
        )
        .unwrap();
        assert!(matches!(creds.source, TokenSource::ClientSecret { .. }));
        assert!(!format!("{creds:?}").contains("some-client-secret"));
    }

    #[test]
    fn test_json_config_and_managed_identity() {
        let creds =
            AzureCredentials::from_config(br#"{"clientId": "identity-client-id"}"#).unwrap();
        assert!(matches!(
            creds.source,
            TokenSource::ManagedIdentity { client_id: Some(ref id) } if id == "identity-client-id"
        ));
    }

    #[test]
    fn test_incomplete_config_is_unsupported() {
        let err = AzureCredentials::from_config(b"tenantId: incomplete").unwrap_err();
        assert!(err.starts_with("unsupported config"));
        let err =
            AzureCredentials::from_config(b"tenantId: t\nclientId: c\nclientCertificate: pem\n")
                .unwrap_err();
        assert!(err.starts_with("unsupported config"));
    }

    #[test]
    fn test_malformed_config() {
        let err = AzureCredentials::from_config(br#"{"malformed\: JSON"}"#).unwrap_err();
        assert!(err.contains("failed to parse AAD config"));
    }

    #[test]
    fn test_unwrap_url() {
        let key = AzureKvKey {
            vault_url: "https://myvault.vault.azure.net/".to_string(),
            name: "sops-key".to_string(),
            version: "abc123".to_string(),
            ..AzureKvKey::default()
        };
        assert_eq!(
            key.unwrap_url(),
            "https://myvault.vault.azure.net/keys/sops-key/abc123/unwrapkey?api-version=7.4"
        );
    }

    #[tokio::test]
    async fn test_incomplete_key() {
        let err = AzureKvKey::default()
            .unseal(&AzureCredentials::ambient(), &UnsealContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing vault_url"));
    }
}
