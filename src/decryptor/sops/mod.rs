//! # SOPS Codec
//!
//! Decrypts and encrypts SOPS documents in every supported store format.
//!
//! ## Decryption
//!
//! 1. Parse the document with the input format's store and split off the
//!    `sops` metadata entry
//! 2. Unseal the data key with the first key group a configured backend can
//!    open
//! 3. Walk the tree, decrypting every value the field selector marks as
//!    encrypted and hashing leaf plaintext into the MAC
//! 4. Verify the MAC, then emit the tree with the output format's store
//!
//! Converting formats is just emitting with a different store: an INI
//! document decrypted with YAML output becomes the equivalent YAML mapping.

pub mod cipher;
pub mod metadata;
pub mod redact;
pub(crate) mod stores;
pub mod tree;

use std::time::Instant;

use chrono::SecondsFormat;
use sha2::{Digest, Sha512};
use tracing::{debug, info_span, warn, Instrument};

pub use super::error::SopsError;
pub use cipher::DataKey;
pub use metadata::{FieldSelector, KeyGroup, Metadata};

use self::cipher::{decrypt_value, encrypt_value};
use self::redact::safe_decrypt;
use self::stores::store_for;
use self::tree::{Map, Value};
use super::format::Format;
use super::keys::{unseal_data_key, CredentialStore, UnsealContext};
use crate::constants::{NO_MAC, SOPS_METADATA_KEY};
use crate::observability::metrics;

/// Decrypts documents with the credentials of one reconciliation attempt
#[derive(Debug, Clone, Copy)]
pub struct CryptoPipeline<'a> {
    credentials: &'a CredentialStore,
    ctx: &'a UnsealContext,
}

impl<'a> CryptoPipeline<'a> {
    pub fn new(credentials: &'a CredentialStore, ctx: &'a UnsealContext) -> Self {
        Self { credentials, ctx }
    }

    /// Decrypt an encrypted document of `input` format into plaintext of `output` format.
    ///
    /// # Errors
    ///
    /// Returns [`SopsError`] when the document cannot be parsed, no key group
    /// can be unsealed, the MAC does not verify, or the plaintext cannot be
    /// represented in the output format.
    pub async fn decrypt(
        &self,
        buf: &[u8],
        input: Format,
        output: Format,
    ) -> Result<Vec<u8>, SopsError> {
        let span = info_span!(
            "sops.decrypt",
            input.format = %input,
            output.format = %output,
            size = buf.len(),
            operation.success = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            error.message = tracing::field::Empty,
        );
        let span_clone = span.clone();

        async move {
            let start = Instant::now();
            metrics::increment_sops_decryption_total();

            let result = self.decrypt_document(buf, input, output).await;

            let elapsed = start.elapsed();
            metrics::observe_sops_decryption_duration(elapsed.as_secs_f64());
            span_clone.record(
                "duration_ms",
                u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            );
            span_clone.record("operation.success", result.is_ok());
            if let Err(err) = &result {
                span_clone.record("error.message", err.to_string());
                metrics::increment_sops_decryption_errors(error_kind(err));
                if matches!(err, SopsError::Integrity(_)) {
                    metrics::increment_integrity_failures();
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn decrypt_document(
        &self,
        buf: &[u8],
        input: Format,
        output: Format,
    ) -> Result<Vec<u8>, SopsError> {
        let input_store = store_for(input)?;
        let output_store = store_for(output)?;

        let (mut tree, metadata_tree) = input_store.load_encrypted(buf)?;
        let metadata = Metadata::from_tree(&metadata_tree)?;
        if metadata.shamir_threshold > 1 {
            return Err(SopsError::Unsupported(format!(
                "shamir threshold {} across key groups",
                metadata.shamir_threshold
            )));
        }

        let key = unseal_data_key(&metadata, self.credentials, self.ctx).await?;
        debug!(version = %metadata.version, "unsealed data key");

        let mut walker = TreeWalker::new(&key, &metadata);
        walker.decrypt_map(&mut tree, &mut Vec::new(), None)?;
        verify_mac(&metadata, &key, &walker.mac())?;

        output_store.emit_plain(&tree)
    }

    /// Encrypt a plaintext document, sealing a fresh data key with every
    /// master key in `metadata`.
    ///
    /// Only age recipients can seal locally; documents for other backends
    /// are produced by the `sops` tool.
    ///
    /// # Errors
    ///
    /// Returns [`SopsError`] when the plaintext cannot be parsed, is already
    /// encrypted, a master key cannot seal, or the output cannot be emitted.
    pub fn encrypt(
        &self,
        metadata: &Metadata,
        plaintext: &[u8],
        input: Format,
        output: Format,
    ) -> Result<Vec<u8>, SopsError> {
        encrypt_document(metadata, plaintext, input, output)
    }
}

/// Encrypt `plaintext` without any imported credentials
///
/// # Errors
///
/// See [`CryptoPipeline::encrypt`].
pub fn encrypt_document(
    metadata: &Metadata,
    plaintext: &[u8],
    input: Format,
    output: Format,
) -> Result<Vec<u8>, SopsError> {
    let input_store = store_for(input)?;
    let output_store = store_for(output)?;

    let mut tree = input_store.load_plain(plaintext)?;
    if tree.get(SOPS_METADATA_KEY).is_some() {
        return Err(SopsError::AlreadyEncrypted);
    }
    if metadata.key_groups.iter().all(|group| group.keys.is_empty()) {
        return Err(SopsError::Seal("no master keys to seal the data key with".to_string()));
    }

    let key = DataKey::generate();
    let mut sealed = metadata.clone();
    for group in &mut sealed.key_groups {
        for master_key in &mut group.keys {
            *master_key = master_key.seal(&key)?;
        }
    }
    if sealed.key_groups.len() > 1 {
        // Every group holds the full data key
        sealed.shamir_threshold = 1;
    }
    sealed.last_modified = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut walker = TreeWalker::new(&key, &sealed);
    walker.encrypt_map(&mut tree, &mut Vec::new(), None)?;
    let mac = walker.mac();
    sealed.mac = encrypt_value(mac.as_bytes(), "str", &key, &sealed.last_modified)
        .map_err(|reason| SopsError::Value {
            path: "sops.mac".to_string(),
            reason,
        })?;

    output_store.emit_encrypted(&tree, &sealed.to_tree()?)
}

fn verify_mac(metadata: &Metadata, key: &DataKey, computed: &str) -> Result<(), SopsError> {
    if metadata.mac.is_empty() {
        return Err(SopsError::Integrity(format!("expected mac '{NO_MAC}'")));
    }
    let stored = safe_decrypt(
        decrypt_value(&metadata.mac, key, &metadata.last_modified)
            .and_then(|(bytes, _)| String::from_utf8(bytes).map_err(|e| e.to_string())),
    )
    .map_err(SopsError::Integrity)?;
    if stored != computed {
        warn!("sops MAC mismatch");
        return Err(SopsError::Integrity(format!("expected mac '{stored}', got '{computed}'")));
    }
    Ok(())
}

fn error_kind(err: &SopsError) -> &'static str {
    match err {
        SopsError::Load { .. } | SopsError::LoadPlain { .. } => "parse",
        SopsError::MetadataNotFound | SopsError::Metadata(_) => "metadata",
        SopsError::DataKey(_) => "data_key",
        SopsError::Integrity(_) => "integrity",
        SopsError::Cancelled => "cancelled",
        _ => "codec",
    }
}

/// Walks a document tree, transforming selected leaves and hashing plaintext
struct TreeWalker<'a> {
    key: &'a DataKey,
    selector: &'a FieldSelector,
    mac_only_encrypted: bool,
    hasher: Sha512,
}

impl<'a> TreeWalker<'a> {
    fn new(key: &'a DataKey, metadata: &'a Metadata) -> Self {
        Self {
            key,
            selector: &metadata.selector,
            mac_only_encrypted: metadata.mac_only_encrypted,
            hasher: Sha512::new(),
        }
    }

    /// Upper-case hex digest of everything hashed so far
    fn mac(&self) -> String {
        hex::encode_upper(self.hasher.clone().finalize())
    }

    fn is_encrypted(&self, decided: Option<bool>) -> bool {
        decided.unwrap_or_else(|| self.selector.encrypt_by_default())
    }

    fn hash(&mut self, bytes: &[u8], encrypted: bool) {
        if encrypted || !self.mac_only_encrypted {
            self.hasher.update(bytes);
        }
    }

    fn decrypt_map(
        &mut self,
        map: &mut Map,
        path: &mut Vec<String>,
        decided: Option<bool>,
    ) -> Result<(), SopsError> {
        for (key, value) in map.iter_mut() {
            let decided = decided.or_else(|| self.selector.decide(key));
            path.push(key.clone());
            self.decrypt_node(value, path, decided)?;
            path.pop();
        }
        Ok(())
    }

    fn decrypt_node(
        &mut self,
        node: &mut Value,
        path: &mut Vec<String>,
        decided: Option<bool>,
    ) -> Result<(), SopsError> {
        match node {
            Value::Map(map) => self.decrypt_map(map, path, decided),
            Value::Seq(items) => items
                .iter_mut()
                .try_for_each(|item| self.decrypt_node(item, path, decided)),
            Value::Null => Ok(()),
            leaf => {
                let encrypted = self.is_encrypted(decided);
                match leaf {
                    Value::String(ciphertext) if encrypted && !ciphertext.is_empty() => {
                        let (plaintext, kind) = decrypt_value(ciphertext, self.key, &aad(path))
                            .map_err(|reason| value_error(path, reason))?;
                        self.hash(&plaintext, true);
                        *leaf = Value::from_plaintext(plaintext, &kind)
                            .map_err(|reason| value_error(path, reason))?;
                    }
                    Value::String(_) if encrypted => {}
                    _ if encrypted => {
                        return Err(value_error(
                            path,
                            "expected an encrypted string value".to_string(),
                        ));
                    }
                    _ => {
                        if let Some((plaintext, _)) = leaf.to_plaintext() {
                            self.hash(&plaintext, false);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn encrypt_map(
        &mut self,
        map: &mut Map,
        path: &mut Vec<String>,
        decided: Option<bool>,
    ) -> Result<(), SopsError> {
        for (key, value) in map.iter_mut() {
            let decided = decided.or_else(|| self.selector.decide(key));
            path.push(key.clone());
            self.encrypt_node(value, path, decided)?;
            path.pop();
        }
        Ok(())
    }

    fn encrypt_node(
        &mut self,
        node: &mut Value,
        path: &mut Vec<String>,
        decided: Option<bool>,
    ) -> Result<(), SopsError> {
        match node {
            Value::Map(map) => self.encrypt_map(map, path, decided),
            Value::Seq(items) => items
                .iter_mut()
                .try_for_each(|item| self.encrypt_node(item, path, decided)),
            leaf => {
                let encrypted = self.is_encrypted(decided);
                let Some((plaintext, kind)) = leaf.to_plaintext() else {
                    return Ok(());
                };
                self.hash(&plaintext, encrypted);
                if encrypted && !plaintext.is_empty() {
                    let sealed = encrypt_value(&plaintext, kind, self.key, &aad(path))
                        .map_err(|reason| value_error(path, reason))?;
                    *leaf = Value::String(sealed);
                }
                Ok(())
            }
        }
    }
}

/// Additional data binding a value to its key path
fn aad(path: &[String]) -> String {
    let mut aad = path.join(":");
    aad.push(':');
    aad
}

fn value_error(path: &[String], reason: String) -> SopsError {
    SopsError::Value {
        path: path.join(":"),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decryptor::keys::{AgeKey, MasterKey};
    use age::secrecy::ExposeSecret;

    struct Fixture {
        credentials: CredentialStore,
        ctx: UnsealContext,
        recipient: String,
    }

    fn fixture() -> Fixture {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public().to_string();
        let mut credentials = CredentialStore::default();
        credentials
            .add_age_identities(identity.to_string().expose_secret())
            .unwrap();
        Fixture {
            credentials,
            ctx: UnsealContext::default(),
            recipient,
        }
    }

    fn metadata_for(recipient: &str) -> Metadata {
        Metadata::new(vec![KeyGroup::new(vec![MasterKey::Age(AgeKey::new(recipient))])])
    }

    #[tokio::test]
    async fn test_round_trip_every_format() {
        let f = fixture();
        let pipeline = CryptoPipeline::new(&f.credentials, &f.ctx);
        let cases = [
            (
                Format::Yaml,
                "key: value\nnested:\n    list:\n        - 1\n        - true\n".as_bytes(),
            ),
            (Format::Json, "{\n\t\"key\": \"value\",\n\t\"n\": 1.5\n}\n".as_bytes()),
            (Format::Ini, "[config]\nkey = value\n".as_bytes()),
            (Format::Dotenv, "KEY=value\nOTHER=a\\nb\n".as_bytes()),
            (Format::Binary, "raw bytes, not parsed\n".as_bytes()),
        ];
        for (format, plaintext) in cases {
            let encrypted = pipeline
                .encrypt(&metadata_for(&f.recipient), plaintext, format, format)
                .unwrap();
            assert!(format.has_marker(&encrypted), "{format} marker missing");
            let decrypted = pipeline.decrypt(&encrypted, format, format).await.unwrap();
            assert_eq!(decrypted, plaintext, "{format} round trip");
        }
    }

    #[tokio::test]
    async fn test_ini_to_yaml_conversion() {
        let f = fixture();
        let pipeline = CryptoPipeline::new(&f.credentials, &f.ctx);
        let encrypted = pipeline
            .encrypt(
                &metadata_for(&f.recipient),
                b"[config]\nkey = value\n",
                Format::Ini,
                Format::Ini,
            )
            .unwrap();
        let decrypted = pipeline.decrypt(&encrypted, Format::Ini, Format::Yaml).await.unwrap();
        assert_eq!(String::from_utf8(decrypted).unwrap(), "config:\n    key: value\n");
    }

    #[tokio::test]
    async fn test_encrypted_regex_leaves_other_fields_plain() {
        let f = fixture();
        let pipeline = CryptoPipeline::new(&f.credentials, &f.ctx);
        let metadata = metadata_for(&f.recipient)
            .with_selector(FieldSelector::encrypted_regex("^(data|stringData)$").unwrap());
        let plaintext = "apiVersion: v1\nkind: Secret\nstringData:\n    password: hunter2\n";
        let encrypted = pipeline
            .encrypt(&metadata, plaintext.as_bytes(), Format::Yaml, Format::Yaml)
            .unwrap();
        let text = String::from_utf8(encrypted.clone()).unwrap();
        assert!(text.contains("kind: Secret"));
        assert!(!text.contains("hunter2"));

        let decrypted = pipeline.decrypt(&encrypted, Format::Yaml, Format::Yaml).await.unwrap();
        assert_eq!(String::from_utf8(decrypted).unwrap(), plaintext);
    }

    #[tokio::test]
    async fn test_erased_mac_is_an_integrity_error() {
        let f = fixture();
        let pipeline = CryptoPipeline::new(&f.credentials, &f.ctx);
        let encrypted = pipeline
            .encrypt(&metadata_for(&f.recipient), b"key: value\n", Format::Yaml, Format::Yaml)
            .unwrap();
        let (tree, metadata_tree) =
            store_for(Format::Yaml).unwrap().load_encrypted(&encrypted).unwrap();
        let mut metadata = Metadata::from_tree(&metadata_tree).unwrap();
        metadata.mac = String::new();
        let tampered = store_for(Format::Yaml)
            .unwrap()
            .emit_encrypted(&tree, &metadata.to_tree().unwrap())
            .unwrap();

        let err = pipeline.decrypt(&tampered, Format::Yaml, Format::Yaml).await.unwrap_err();
        assert!(matches!(err, SopsError::Integrity(_)));
        assert!(err
            .to_string()
            .contains("failed to verify sops data integrity: expected mac 'no MAC'"));
    }

    #[tokio::test]
    async fn test_malformed_mac_is_redacted() {
        let f = fixture();
        let pipeline = CryptoPipeline::new(&f.credentials, &f.ctx);
        let encrypted = pipeline
            .encrypt(&metadata_for(&f.recipient), b"key: value\n", Format::Yaml, Format::Yaml)
            .unwrap();
        let (tree, metadata_tree) =
            store_for(Format::Yaml).unwrap().load_encrypted(&encrypted).unwrap();
        let mut metadata = Metadata::from_tree(&metadata_tree).unwrap();
        metadata.mac = "1234567897".to_string();
        let tampered = store_for(Format::Yaml)
            .unwrap()
            .emit_encrypted(&tree, &metadata.to_tree().unwrap())
            .unwrap();

        let message = pipeline
            .decrypt(&tampered, Format::Yaml, Format::Yaml)
            .await
            .unwrap_err()
            .to_string();
        assert!(message.contains("<redacted>"));
        assert!(!message.contains("1234567897"));
    }

    #[tokio::test]
    async fn test_tampered_value_fails() {
        let f = fixture();
        let pipeline = CryptoPipeline::new(&f.credentials, &f.ctx);
        let encrypted = pipeline
            .encrypt(&metadata_for(&f.recipient), b"a: one\nb: two\n", Format::Yaml, Format::Yaml)
            .unwrap();
        // Swapping two ciphertexts breaks their additional data
        let (mut tree, metadata_tree) =
            store_for(Format::Yaml).unwrap().load_encrypted(&encrypted).unwrap();
        let a = tree.get("a").cloned().unwrap();
        let b = tree.get("b").cloned().unwrap();
        tree.insert("a", b);
        tree.insert("b", a);
        let swapped = store_for(Format::Yaml)
            .unwrap()
            .emit_encrypted(&tree, &metadata_tree)
            .unwrap();
        assert!(matches!(
            pipeline.decrypt(&swapped, Format::Yaml, Format::Yaml).await,
            Err(SopsError::Value { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_matching_credentials() {
        let f = fixture();
        let other = age::x25519::Identity::generate().to_public().to_string();
        let pipeline = CryptoPipeline::new(&f.credentials, &f.ctx);
        let encrypted = pipeline
            .encrypt(&metadata_for(&other), b"key: value\n", Format::Yaml, Format::Yaml)
            .unwrap();
        let err = pipeline.decrypt(&encrypted, Format::Yaml, Format::Yaml).await.unwrap_err();
        assert!(matches!(err, SopsError::DataKey(_)));
        assert!(err.to_string().starts_with("cannot get sops data key"));
    }

    #[tokio::test]
    async fn test_unparseable_document() {
        let f = fixture();
        let pipeline = CryptoPipeline::new(&f.credentials, &f.ctx);
        let err = pipeline
            .decrypt(b"{not json", Format::Json, Format::Json)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to load encrypted JSON data"));
    }

    #[test]
    fn test_encrypt_rejects_encrypted_input() {
        let recipient = age::x25519::Identity::generate().to_public().to_string();
        assert!(matches!(
            encrypt_document(
                &metadata_for(&recipient),
                b"sops:\n    mac: x\n",
                Format::Yaml,
                Format::Yaml,
            ),
            Err(SopsError::AlreadyEncrypted)
        ));
    }

    #[test]
    fn test_aad() {
        assert_eq!(aad(&["a".to_string(), "b".to_string()]), "a:b:");
        assert_eq!(aad(&["data".to_string()]), "data:");
    }
}
