//! HTTP plumbing shared by the REST-backed key services.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::decryptor::error::{Backend, UnsealError};

/// Error bodies are cut to this length before they reach error messages
const MAX_ERROR_BODY: usize = 512;

/// Tokens are refreshed this long before they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Send a request and decode its JSON response
pub(super) async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> anyhow::Result<T> {
    let response = request.send().await.context("request failed")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_ERROR_BODY).collect();
        return Err(anyhow!("HTTP {status}: {}", body.trim()));
    }
    response.json::<T>().await.context("failed to decode response")
}

/// Map plumbing errors into an unseal failure for `backend`
pub(super) fn unseal_error(backend: Backend) -> impl Fn(anyhow::Error) -> UnsealError {
    move |err| UnsealError::failed(backend, format!("{err:#}"))
}

pub(super) fn decode_standard(backend: Backend, value: &str) -> Result<Vec<u8>, UnsealError> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| UnsealError::failed(backend, format!("invalid base64 in response: {e}")))
}

/// OAuth2 token endpoint response
#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: String,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<u64>,
}

/// IMDS reports `expires_in` as a string, token endpoints as a number
fn lenient_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
    }
    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Number(n)) => Ok(Some(n)),
        Some(Seconds::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

struct CachedToken {
    token: Zeroizing<String>,
    expires_at: Instant,
}

/// A bearer token reused until shortly before it expires
#[derive(Default)]
pub(super) struct TokenCache(Mutex<Option<CachedToken>>);

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCache(..)")
    }
}

impl TokenCache {
    /// Cached token, or a fresh one from `fetch`
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> anyhow::Result<Zeroizing<String>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<TokenResponse>>,
    {
        let mut cached = self.0.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < token.expires_at {
                return Ok(token.token.clone());
            }
        }
        let response = fetch().await?;
        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(300));
        let token = Zeroizing::new(response.access_token);
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_accepts_string_expiry() {
        let parsed: TokenResponse =
            serde_json::from_str(r#"{"access_token": "t", "expires_in": "3599"}"#).unwrap();
        assert_eq!(parsed.expires_in, Some(3599));
        let parsed: TokenResponse =
            serde_json::from_str(r#"{"access_token": "t", "expires_in": 3599}"#).unwrap();
        assert_eq!(parsed.expires_in, Some(3599));
        let parsed: TokenResponse = serde_json::from_str(r#"{"access_token": "t"}"#).unwrap();
        assert_eq!(parsed.expires_in, None);
    }

    #[tokio::test]
    async fn test_token_cache_reuses_token() {
        let cache = TokenCache::default();
        let first = cache
            .get_or_fetch(|| async {
                Ok(TokenResponse {
                    access_token: "first".to_string(),
                    expires_in: Some(3600),
                })
            })
            .await
            .unwrap();
        let second = cache
            .get_or_fetch(|| async { Err(anyhow!("should not be called")) })
            .await
            .unwrap();
        assert_eq!(*first, "first");
        assert_eq!(*second, "first");
    }

    #[tokio::test]
    async fn test_token_cache_refreshes_expiring_token() {
        let cache = TokenCache::default();
        cache
            .get_or_fetch(|| async {
                Ok(TokenResponse {
                    access_token: "short".to_string(),
                    expires_in: Some(10),
                })
            })
            .await
            .unwrap();
        let refreshed = cache
            .get_or_fetch(|| async {
                Ok(TokenResponse {
                    access_token: "fresh".to_string(),
                    expires_in: Some(3600),
                })
            })
            .await
            .unwrap();
        assert_eq!(*refreshed, "fresh");
    }

    #[test]
    fn test_decode_standard() {
        assert_eq!(decode_standard(Backend::HcVault, "aGk=").unwrap(), b"hi");
        assert!(decode_standard(Backend::HcVault, "%%").is_err());
    }
}
