//! # AWS KMS Master Keys
//!
//! Unseals with the KMS `Decrypt` API through the official SDK. Credentials
//! come from the `sops.aws-kms` Secret entry or the ambient default chain
//! (IRSA, instance profile, environment).

use std::collections::BTreeMap;
use std::fmt;

use aws_config::SdkConfig;
use aws_credential_types::Credentials;
use aws_sdk_kms::primitives::Blob;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::decryptor::error::{Backend, UnsealError};

/// `kms` entry of SOPS metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsKmsKey {
    #[serde(default)]
    pub arn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub enc: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_profile: String,
}

/// Credentials used to call AWS KMS
pub enum AwsCredentials {
    /// Access key from the decryption Secret
    Static {
        access_key_id: String,
        secret_access_key: Zeroizing<String>,
        session_token: Option<Zeroizing<String>>,
    },
    /// The SDK default credential chain
    Ambient,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AwsCredentials::Static { access_key_id, .. } => f
                .debug_struct("Static")
                .field("access_key_id", access_key_id)
                .finish_non_exhaustive(),
            AwsCredentials::Ambient => f.write_str("Ambient"),
        }
    }
}

#[derive(Deserialize)]
struct CredentialsDoc {
    #[serde(default)]
    aws_access_key_id: String,
    #[serde(default)]
    aws_secret_access_key: String,
    #[serde(default)]
    aws_session_token: Option<String>,
}

impl AwsCredentials {
    /// Parse the `sops.aws-kms` YAML document
    pub fn from_yaml(data: &[u8]) -> Result<Self, String> {
        let doc: CredentialsDoc = serde_yaml::from_slice(data)
            .map_err(|e| format!("failed to parse credentials: {e}"))?;
        if doc.aws_access_key_id.is_empty() || doc.aws_secret_access_key.is_empty() {
            return Err(
                "credentials require 'aws_access_key_id' and 'aws_secret_access_key'".to_string(),
            );
        }
        Ok(AwsCredentials::Static {
            access_key_id: doc.aws_access_key_id,
            secret_access_key: Zeroizing::new(doc.aws_secret_access_key),
            session_token: doc.aws_session_token.filter(|t| !t.is_empty()).map(Zeroizing::new),
        })
    }
}

impl AwsKmsKey {
    /// Region embedded in the key ARN (`arn:aws:kms:<region>:...`)
    fn region(&self) -> Option<&str> {
        self.arn.split(':').nth(3).filter(|region| !region.is_empty())
    }

    async fn sdk_config(&self, credentials: &AwsCredentials) -> Result<SdkConfig, UnsealError> {
        let region = self.region().ok_or_else(|| {
            UnsealError::failed(Backend::AwsKms, format!("no region in key ARN '{}'", self.arn))
        })?;
        let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()));
        if let AwsCredentials::Static {
            access_key_id,
            secret_access_key,
            session_token,
        } = credentials
        {
            builder = builder.credentials_provider(Credentials::new(
                access_key_id.clone(),
                secret_access_key.as_str(),
                session_token.as_ref().map(|t| t.to_string()),
                None,
                "decryption-secret",
            ));
        } else if !self.aws_profile.is_empty() {
            builder = builder.profile_name(&self.aws_profile);
        }
        let sdk_config = builder.load().await;

        if self.role.is_empty() {
            return Ok(sdk_config);
        }
        debug!(role = %self.role, "assuming role for KMS decrypt");
        let provider = aws_config::sts::AssumeRoleProvider::builder(&self.role)
            .session_name("sops-decryptor")
            .configure(&sdk_config)
            .build()
            .await;
        Ok(sdk_config
            .into_builder()
            .credentials_provider(
                aws_credential_types::provider::SharedCredentialsProvider::new(provider),
            )
            .build())
    }

    pub(crate) async fn unseal(
        &self,
        credentials: &AwsCredentials,
    ) -> Result<Vec<u8>, UnsealError> {
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(&self.enc)
            .map_err(|e| {
                UnsealError::failed(Backend::AwsKms, format!("invalid base64 in enc: {e}"))
            })?;
        let sdk_config = self.sdk_config(credentials).await?;
        let client = aws_sdk_kms::Client::new(&sdk_config);

        let context = (!self.context.is_empty()).then(|| {
            self.context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        });
        let output = client
            .decrypt()
            .key_id(&self.arn)
            .ciphertext_blob(Blob::new(ciphertext))
            .set_encryption_context(context)
            .send()
            .await
            .map_err(|e| {
                UnsealError::failed(Backend::AwsKms, aws_sdk_kms::error::DisplayErrorContext(e))
            })?;

        output
            .plaintext
            .map(Blob::into_inner)
            .ok_or_else(|| UnsealError::failed(Backend::AwsKms, "KMS returned no plaintext"))
    }
}
