//! # GCP Cloud KMS Master Keys
//!
//! Unseals through the Cloud KMS REST API:
//! `POST https://cloudkms.googleapis.com/v1/{resource_id}:decrypt`
//!
//! Access tokens come from, in order of configuration:
//! - a service account JSON key (JWT bearer grant signed with RS256)
//! - an `authorized_user` JSON (refresh token grant)
//! - the ambient environment: `GOOGLE_APPLICATION_CREDENTIALS`, then the
//!   metadata server (workload identity)

use std::fmt;

use anyhow::{anyhow, Context};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::http::{decode_standard, send_json, unseal_error, TokenCache, TokenResponse};
use super::UnsealContext;
use crate::constants::{GCP_KMS_ENDPOINT, GCP_KMS_SCOPE, GCP_METADATA_TOKEN_URL, GCP_TOKEN_URI};
use crate::decryptor::error::{Backend, UnsealError};

/// Lifetime requested for self-signed JWT assertions
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// `gcp_kms` entry of SOPS metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpKmsKey {
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub enc: String,
}

enum TokenSource {
    ServiceAccount {
        client_email: String,
        private_key: Zeroizing<String>,
        token_uri: String,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: Zeroizing<String>,
        refresh_token: Option<Zeroizing<String>>,
    },
    Ambient,
}

/// Credentials used to call Cloud KMS
pub struct GcpCredentials {
    source: TokenSource,
    cache: TokenCache,
}

impl fmt::Debug for GcpCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.source {
            TokenSource::ServiceAccount { client_email, .. } => {
                format!("ServiceAccount({client_email})")
            }
            TokenSource::AuthorizedUser { client_id, .. } => format!("AuthorizedUser({client_id})"),
            TokenSource::Ambient => "Ambient".to_string(),
        };
        f.debug_struct("GcpCredentials").field("source", &kind).finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct CredentialsDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    client_email: String,
    #[serde(default)]
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

impl GcpCredentials {
    /// Parse a service account or `authorized_user` credentials JSON.
    ///
    /// A missing refresh token is accepted here and only fails when a token
    /// is requested.
    pub fn from_json(data: &[u8]) -> Result<Self, String> {
        let doc: CredentialsDoc = serde_json::from_slice(data)
            .map_err(|e| format!("failed to parse credentials JSON: {e}"))?;
        let source = match doc.kind.as_str() {
            "service_account" => {
                if doc.client_email.is_empty() || doc.private_key.is_empty() {
                    return Err(
                        "service account requires 'client_email' and 'private_key'".to_string()
                    );
                }
                EncodingKey::from_rsa_pem(doc.private_key.as_bytes())
                    .map_err(|e| format!("invalid service account private key: {e}"))?;
                TokenSource::ServiceAccount {
                    client_email: doc.client_email,
                    private_key: Zeroizing::new(doc.private_key),
                    token_uri: doc.token_uri.unwrap_or_else(|| GCP_TOKEN_URI.to_string()),
                }
            }
            "authorized_user" => {
                if doc.client_id.is_empty() || doc.client_secret.is_empty() {
                    return Err(
                        "authorized_user requires 'client_id' and 'client_secret'".to_string()
                    );
                }
                TokenSource::AuthorizedUser {
                    client_id: doc.client_id,
                    client_secret: Zeroizing::new(doc.client_secret),
                    refresh_token: doc.refresh_token.filter(|t| !t.is_empty()).map(Zeroizing::new),
                }
            }
            other => return Err(format!("unsupported credentials type '{other}'")),
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
                    TokenSource::Ambient => {
                        match std::env::var_os("GOOGLE_APPLICATION_CREDENTIALS") {
                            Some(path) => {
                                let data = tokio::fs::read(&path).await.with_context(|| {
                                    format!("failed to read {}", path.to_string_lossy())
                                })?;
                                let explicit =
                                    GcpCredentials::from_json(&data).map_err(|e| anyhow!(e))?;
                                fetch_token(&explicit.source, http).await
                            }
                            None => fetch_token(&self.source, http).await,
                        }
                    }
                    source => fetch_token(source, http).await,
                }
            })
            .await
    }
}

async fn fetch_token(
    source: &TokenSource,
    http: &reqwest::Client,
) -> anyhow::Result<TokenResponse> {
    match source {
        TokenSource::ServiceAccount {
            client_email,
            private_key,
            token_uri,
        } => {
            let iat = chrono::Utc::now().timestamp();
            let claims = AssertionClaims {
                iss: client_email,
                scope: GCP_KMS_SCOPE,
                aud: token_uri,
                iat,
                exp: iat + ASSERTION_LIFETIME_SECS,
            };
            let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
                .context("invalid private key")?;
            let assertion = Zeroizing::new(
                jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
                    .context("failed to sign assertion")?,
            );
            let form = [
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ];
            send_json(http.post(token_uri).form(&form)).await
        }
        TokenSource::AuthorizedUser {
            client_id,
            client_secret,
            refresh_token,
        } => {
            let refresh_token = refresh_token
                .as_ref()
                .ok_or_else(|| anyhow!("authorized_user credentials have no refresh_token"))?;
            let form = [
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ];
            send_json(http.post(GCP_TOKEN_URI).form(&form)).await
        }
        TokenSource::Ambient => {
            send_json(http.get(GCP_METADATA_TOKEN_URL).header("Metadata-Flavor", "Google")).await
        }
    }
}

impl GcpKmsKey {
    pub(crate) async fn unseal(
        &self,
        credentials: &GcpCredentials,
        ctx: &UnsealContext,
    ) -> Result<Vec<u8>, UnsealError> {
        if self.resource_id.is_empty() {
            return Err(UnsealError::failed(Backend::GcpKms, "key is missing resource_id"));
        }
        let token = credentials
            .access_token(&ctx.http)
            .await
            .map_err(unseal_error(Backend::GcpKms))?;
        let request = ctx
            .http
            .post(format!("{GCP_KMS_ENDPOINT}/{}:decrypt", self.resource_id))
            .bearer_auth(token.as_str())
            .json(&DecryptRequest { ciphertext: &self.enc });
        let response: DecryptResponse = send_json(request)
            .await
            .map_err(unseal_error(Backend::GcpKms))?;
        let plaintext = Zeroizing::new(response.plaintext);
        decode_standard(Backend::GcpKms, &plaintext)
    }
}
