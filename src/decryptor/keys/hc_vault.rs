//! HashiCorp Vault transit master keys.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::http::{decode_standard, send_json, unseal_error};
use super::UnsealContext;
use crate::decryptor::error::{Backend, UnsealError};

/// `hc_vault` entry of SOPS metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultKey {
    #[serde(default)]
    pub vault_address: String,
    #[serde(default)]
    pub engine_path: String,
    #[serde(default)]
    pub key_name: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub enc: String,
}

#[derive(Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
}

#[derive(Deserialize)]
struct DecryptResponse {
    data: DecryptData,
}

#[derive(Deserialize)]
struct DecryptData {
    plaintext: String,
}

impl VaultKey {
    /// `{vault_address}/v1/{engine_path}/decrypt/{key_name}`
    fn decrypt_url(&self) -> String {
        format!(
            "{}/v1/{}/decrypt/{}",
            self.vault_address.trim_end_matches('/'),
            self.engine_path.trim_matches('/'),
            self.key_name
        )
    }

    /// The token is sent as-is in `X-Vault-Token`
    pub(crate) async fn unseal(
        &self,
        token: &Zeroizing<String>,
        ctx: &UnsealContext,
    ) -> Result<Vec<u8>, UnsealError> {
        if self.vault_address.is_empty() || self.key_name.is_empty() {
            return Err(UnsealError::failed(
                Backend::HcVault,
                "key is missing vault_address or key_name",
            ));
        }
        let request = ctx
            .http
            .post(self.decrypt_url())
            .header("X-Vault-Token", token.as_str())
            .json(&DecryptRequest { ciphertext: &self.enc });
        let response: DecryptResponse = send_json(request)
            .await
            .map_err(unseal_error(Backend::HcVault))?;
        let plaintext = Zeroizing::new(response.data.plaintext);
        decode_standard(Backend::HcVault, &plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypt_url() {
        let key = VaultKey {
            vault_address: "https://vault.example.com:8200/".to_string(),
            engine_path: "/sops/".to_string(),
            key_name: "firstkey".to_string(),
            ..VaultKey::default()
        };
        assert_eq!(
            key.decrypt_url(),
            "https://vault.example.com:8200/v1/sops/decrypt/firstkey"
        );
    }

    #[tokio::test]
    async fn test_incomplete_key() {
        let err = VaultKey::default()
            .unseal(&Zeroizing::new("token".to_string()), &UnsealContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing vault_address"));
    }
}
