//! # Resource Decryption
//!
//! Decrypts rendered resources before they are applied. A resource carrying
//! a top-level `sops` block is decrypted as a whole JSON document. For a
//! Secret without one, each `data` value is base64 decoded and decrypted on
//! its own when it is a SOPS document; other values are left as they are.

use std::time::Instant;

use base64::Engine;
use serde_json::{Map, Value};
use tracing::{debug, info_span, Instrument};

use super::error::DecryptError;
use super::format::{formats_for_encrypted, Format};
use super::sops::CryptoPipeline;
use crate::constants::SOPS_METADATA_KEY;
use crate::observability::metrics;

/// Whether the resource is a SOPS document itself
pub fn is_encrypted_resource(resource: &Value) -> bool {
    resource.get(SOPS_METADATA_KEY).is_some_and(Value::is_object)
}

/// `Kind/namespace/name` for messages
fn describe(resource: &Value) -> String {
    let field = |pointer: &str| {
        resource
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
    };
    let kind = field("/kind");
    let namespace = field("/metadata/namespace");
    let name = field("/metadata/name");
    match (kind, namespace) {
        ("", _) => format!("resource '{name}'"),
        (kind, "") => format!("{kind} '{name}'"),
        (kind, namespace) => format!("{kind} '{namespace}/{name}'"),
    }
}

/// Decrypts resources with one attempt's credentials
#[derive(Debug, Clone, Copy)]
pub struct ResourceDecryptor<'a> {
    pipeline: CryptoPipeline<'a>,
}

impl<'a> ResourceDecryptor<'a> {
    pub fn new(pipeline: CryptoPipeline<'a>) -> Self {
        Self { pipeline }
    }

    /// Decrypt `resource`.
    ///
    /// Returns `None` when nothing in the resource is encrypted, so the
    /// caller keeps it unchanged.
    ///
    /// # Errors
    ///
    /// Fails when an encrypted document or data field cannot be decrypted.
    /// No partially decrypted resource is ever returned.
    pub async fn decrypt(&self, resource: &Value) -> Result<Option<Value>, DecryptError> {
        let description = describe(resource);
        let span = info_span!(
            "decryptor.decrypt_resource",
            resource = %description,
            decrypted = tracing::field::Empty,
            operation.success = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            error.message = tracing::field::Empty,
        );
        let span_clone = span.clone();

        async move {
            let start = Instant::now();
            let result = if is_encrypted_resource(resource) {
                self.decrypt_document(resource, &description).await.map(Some)
            } else if resource.get("kind").and_then(Value::as_str) == Some("Secret") {
                self.decrypt_secret_data(resource, &description).await
            } else {
                Ok(None)
            };

            span_clone.record(
                "duration_ms",
                u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            );
            span_clone.record("operation.success", result.is_ok());
            match &result {
                Ok(decrypted) => {
                    span_clone.record("decrypted", decrypted.is_some());
                    if decrypted.is_some() {
                        metrics::increment_resources_decrypted();
                    }
                }
                Err(err) => {
                    span_clone.record("error.message", err.to_string());
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// The whole resource is a JSON SOPS document
    async fn decrypt_document(
        &self,
        resource: &Value,
        description: &str,
    ) -> Result<Value, DecryptError> {
        let buf = serde_json::to_vec(resource).map_err(|e| DecryptError::Resource {
            resource: description.to_string(),
            reason: format!("failed to marshal resource: {e}"),
        })?;
        let plaintext = self
            .pipeline
            .decrypt(&buf, Format::Json, Format::Json)
            .await
            .map_err(|source| DecryptError::ResourceSops {
                resource: description.to_string(),
                source,
            })?;
        serde_json::from_slice(&plaintext).map_err(|e| DecryptError::Resource {
            resource: description.to_string(),
            reason: format!("failed to unmarshal decrypted resource: {e}"),
        })
    }

    /// Decrypt every encrypted `data` value of a Secret.
    /// `None` when no value was encrypted.
    async fn decrypt_secret_data(
        &self,
        resource: &Value,
        description: &str,
    ) -> Result<Option<Value>, DecryptError> {
        let Some(data) = resource.get("data").and_then(Value::as_object) else {
            return Ok(None);
        };

        let engine = base64::engine::general_purpose::STANDARD;
        let mut decrypted = Map::new();
        for (key, value) in data {
            let Some(encoded) = value.as_str() else {
                continue;
            };
            // Values that are not base64 are not SOPS documents either
            let Ok(raw) = engine.decode(encoded) else {
                continue;
            };
            let (input, output) = formats_for_encrypted(key, &raw);
            if input == Format::Unsupported {
                continue;
            }
            debug!(
                resource = %description,
                key = %key,
                input = %input,
                output = %output,
                "decrypting Secret data field"
            );
            let plaintext = self
                .pipeline
                .decrypt(&raw, input, output)
                .await
                .map_err(|source| DecryptError::ResourceSops {
                    resource: format!("{description} data key '{key}'"),
                    source,
                })?;
            decrypted.insert(key.clone(), Value::String(engine.encode(plaintext)));
        }

        if decrypted.is_empty() {
            return Ok(None);
        }
        let mut resource = resource.clone();
        if let Some(Value::Object(data)) = resource.get_mut("data") {
            data.extend(decrypted);
        }
        Ok(Some(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decryptor::keys::{AgeKey, CredentialStore, MasterKey, UnsealContext};
    use crate::decryptor::sops::{encrypt_document, FieldSelector, KeyGroup, Metadata};
    use age::secrecy::ExposeSecret;
    use serde_json::json;

    struct Fixture {
        credentials: CredentialStore,
        ctx: UnsealContext,
        metadata: Metadata,
    }

    impl Fixture {
        fn new() -> Self {
            let identity = age::x25519::Identity::generate();
            let mut credentials = CredentialStore::default();
            credentials
                .add_age_identities(identity.to_string().expose_secret())
                .unwrap();
            let metadata = Metadata::new(vec![KeyGroup::new(vec![MasterKey::Age(AgeKey::new(
                identity.to_public().to_string(),
            ))])]);
            Self {
                credentials,
                ctx: UnsealContext::default(),
                metadata,
            }
        }

        fn decryptor(&self) -> ResourceDecryptor<'_> {
            ResourceDecryptor::new(CryptoPipeline::new(&self.credentials, &self.ctx))
        }

        fn encrypt_b64(&self, plaintext: &[u8], format: Format) -> String {
            let encrypted = encrypt_document(&self.metadata, plaintext, format, format).unwrap();
            base64::engine::general_purpose::STANDARD.encode(encrypted)
        }
    }

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    #[tokio::test]
    async fn test_unencrypted_resource_is_untouched() {
        let fixture = Fixture::new();
        let secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "plain", "namespace": "default"},
            "data": {"password": b64(b"hunter2")},
        });
        assert_eq!(fixture.decryptor().decrypt(&secret).await.unwrap(), None);

        let config_map = json!({
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "data": {"key": "value"},
        });
        assert_eq!(fixture.decryptor().decrypt(&config_map).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_only_encrypted_fields_change() {
        let fixture = Fixture::new();
        let secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "app", "namespace": "default"},
            "data": {
                "config.yaml": fixture.encrypt_b64(b"user: admin\n", Format::Yaml),
                "plain": b64(b"not encrypted"),
                "notbase64": "%%%",
            },
        });

        let decrypted = fixture.decryptor().decrypt(&secret).await.unwrap().unwrap();
        assert_eq!(decrypted["data"]["config.yaml"], b64(b"user: admin\n"));
        assert_eq!(decrypted["data"]["plain"], secret["data"]["plain"]);
        assert_eq!(decrypted["data"]["notbase64"], "%%%");
        assert_eq!(decrypted["metadata"], secret["metadata"]);
    }

    #[tokio::test]
    async fn test_field_format_follows_key_name() {
        let fixture = Fixture::new();
        let secret = json!({
            "kind": "Secret",
            "metadata": {"name": "registry"},
            "data": {
                ".dockerconfigjson": fixture.encrypt_b64(br#"{"auths": {}}"#, Format::Json),
                "app.env": fixture.encrypt_b64(b"KEY=value\n", Format::Dotenv),
                "raw": fixture.encrypt_b64(b"opaque bytes", Format::Binary),
            },
        });

        let decrypted = fixture.decryptor().decrypt(&secret).await.unwrap().unwrap();
        let field = |key: &str| {
            let encoded = decrypted["data"][key].as_str().unwrap();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap();
            String::from_utf8(bytes).unwrap()
        };
        assert_eq!(field(".dockerconfigjson"), "{\n\t\"auths\": {}\n}\n");
        assert_eq!(field("app.env"), "KEY=value\n");
        assert_eq!(field("raw"), "opaque bytes");
    }

    #[tokio::test]
    async fn test_whole_resource_encrypted() {
        let fixture = Fixture::new();
        let metadata = fixture
            .metadata
            .clone()
            .with_selector(FieldSelector::encrypted_regex("^(data|stringData)$").unwrap());
        let plaintext = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "whole", "namespace": "apps"},
            "stringData": {"token": "s3cr3t"},
        });
        let encrypted = encrypt_document(
            &metadata,
            &serde_json::to_vec(&plaintext).unwrap(),
            Format::Json,
            Format::Json,
        )
        .unwrap();
        let resource: Value = serde_json::from_slice(&encrypted).unwrap();
        assert!(is_encrypted_resource(&resource));
        assert_ne!(resource["stringData"]["token"], "s3cr3t");

        let decrypted = fixture.decryptor().decrypt(&resource).await.unwrap().unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn test_undecryptable_field_fails_whole_resource() {
        let fixture = Fixture::new();
        let other = Fixture::new();
        let secret = json!({
            "kind": "Secret",
            "metadata": {"name": "mixed", "namespace": "default"},
            "data": {
                "a.yaml": fixture.encrypt_b64(b"a: 1\n", Format::Yaml),
                "b.yaml": other.encrypt_b64(b"b: 2\n", Format::Yaml),
            },
        });
        let err = fixture.decryptor().decrypt(&secret).await.unwrap_err();
        assert!(matches!(err, DecryptError::ResourceSops { .. }));
        assert!(err.to_string().contains("Secret 'default/mixed' data key 'b.yaml'"));
    }
}
