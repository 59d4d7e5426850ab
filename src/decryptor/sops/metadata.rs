//! SOPS metadata block.
//!
//! The `sops` entry of an encrypted document lists how the data key is
//! sealed (per backend, optionally in several key groups), the encrypted MAC,
//! and which fields were selected for encryption.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use super::tree::Value;
use super::SopsError;
use crate::constants::{DEFAULT_UNENCRYPTED_SUFFIX, SOPS_METADATA_VERSION};
use crate::decryptor::keys::{AgeKey, AwsKmsKey, AzureKvKey, GcpKmsKey, MasterKey, PgpKey, VaultKey};

/// Alternative master keys sealing the same data key.
/// Unsealing any one of them recovers the data key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyGroup {
    pub keys: Vec<MasterKey>,
}

impl KeyGroup {
    pub fn new(keys: Vec<MasterKey>) -> Self {
        Self { keys }
    }
}

/// Which map keys are (or were) encrypted.
///
/// A key matching the selector decides for its whole subtree.
#[derive(Debug, Clone)]
pub enum FieldSelector {
    UnencryptedSuffix(String),
    EncryptedSuffix(String),
    UnencryptedRegex(Regex),
    EncryptedRegex(Regex),
}

impl Default for FieldSelector {
    fn default() -> Self {
        FieldSelector::UnencryptedSuffix(DEFAULT_UNENCRYPTED_SUFFIX.to_string())
    }
}

impl FieldSelector {
    /// Decision for `key`, or `None` when the key does not match
    pub fn decide(&self, key: &str) -> Option<bool> {
        match self {
            FieldSelector::UnencryptedSuffix(suffix) => {
                key.ends_with(suffix.as_str()).then_some(false)
            }
            FieldSelector::EncryptedSuffix(suffix) => {
                key.ends_with(suffix.as_str()).then_some(true)
            }
            FieldSelector::UnencryptedRegex(re) => re.is_match(key).then_some(false),
            FieldSelector::EncryptedRegex(re) => re.is_match(key).then_some(true),
        }
    }

    /// Whether a leaf no key decided for is encrypted
    pub fn encrypt_by_default(&self) -> bool {
        matches!(
            self,
            FieldSelector::UnencryptedSuffix(_) | FieldSelector::UnencryptedRegex(_)
        )
    }

    /// Regex selector compiled from a pattern
    pub fn encrypted_regex(pattern: &str) -> Result<Self, SopsError> {
        Regex::new(pattern)
            .map(FieldSelector::EncryptedRegex)
            .map_err(|e| SopsError::Metadata(format!("invalid encrypted_regex: {e}")))
    }
}

/// Parsed SOPS metadata
#[derive(Debug, Clone)]
pub struct Metadata {
    pub key_groups: Vec<KeyGroup>,
    pub shamir_threshold: usize,
    pub last_modified: String,
    /// Encrypted MAC, empty when absent
    pub mac: String,
    pub selector: FieldSelector,
    pub mac_only_encrypted: bool,
    pub version: String,
}

impl Metadata {
    /// Metadata template for encryption with the given key groups
    pub fn new(key_groups: Vec<KeyGroup>) -> Self {
        Self {
            key_groups,
            shamir_threshold: 0,
            last_modified: String::new(),
            mac: String::new(),
            selector: FieldSelector::default(),
            mac_only_encrypted: false,
            version: SOPS_METADATA_VERSION.to_string(),
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: FieldSelector) -> Self {
        self.selector = selector;
        self
    }

    #[must_use]
    pub fn with_mac_only_encrypted(mut self, mac_only_encrypted: bool) -> Self {
        self.mac_only_encrypted = mac_only_encrypted;
        self
    }

    /// Parse the metadata subtree of a document
    pub fn from_tree(tree: &Value) -> Result<Self, SopsError> {
        let json = serde_json::Value::from(tree);
        let doc: MetadataDoc =
            serde_json::from_value(json).map_err(|e| SopsError::Metadata(e.to_string()))?;
        doc.try_into()
    }

    /// Serialize into a subtree for the `sops` entry
    pub fn to_tree(&self) -> Result<Value, SopsError> {
        let doc = MetadataDoc::from(self);
        serde_json::to_value(&doc)
            .map(Value::from)
            .map_err(|e| SopsError::Metadata(e.to_string()))
    }
}

/// Per-backend key lists, as they appear in the document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeySlots {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    kms: Vec<AwsKmsKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    gcp_kms: Vec<GcpKmsKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    azure_kv: Vec<AzureKvKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hc_vault: Vec<VaultKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    age: Vec<AgeKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pgp: Vec<PgpKey>,
}

impl KeySlots {
    fn is_empty(&self) -> bool {
        self.kms.is_empty()
            && self.gcp_kms.is_empty()
            && self.azure_kv.is_empty()
            && self.hc_vault.is_empty()
            && self.age.is_empty()
            && self.pgp.is_empty()
    }
}

impl From<KeySlots> for KeyGroup {
    fn from(slots: KeySlots) -> Self {
        let keys = slots
            .kms
            .into_iter()
            .map(MasterKey::AwsKms)
            .chain(slots.gcp_kms.into_iter().map(MasterKey::GcpKms))
            .chain(slots.azure_kv.into_iter().map(MasterKey::AzureKeyVault))
            .chain(slots.hc_vault.into_iter().map(MasterKey::HcVault))
            .chain(slots.age.into_iter().map(MasterKey::Age))
            .chain(slots.pgp.into_iter().map(MasterKey::Pgp))
            .collect();
        KeyGroup { keys }
    }
}

impl From<&KeyGroup> for KeySlots {
    fn from(group: &KeyGroup) -> Self {
        let mut slots = KeySlots::default();
        for key in &group.keys {
            match key {
                MasterKey::AwsKms(k) => slots.kms.push(k.clone()),
                MasterKey::GcpKms(k) => slots.gcp_kms.push(k.clone()),
                MasterKey::AzureKeyVault(k) => slots.azure_kv.push(k.clone()),
                MasterKey::HcVault(k) => slots.hc_vault.push(k.clone()),
                MasterKey::Age(k) => slots.age.push(k.clone()),
                MasterKey::Pgp(k) => slots.pgp.push(k.clone()),
            }
        }
        slots
    }
}

/// Serialized metadata. Flat stores stringify every scalar, so numeric and
/// boolean fields accept strings too.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataDoc {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    key_groups: Vec<KeySlots>,
    #[serde(flatten)]
    slots: KeySlots,
    #[serde(default, skip_serializing_if = "is_zero", deserialize_with = "lenient_usize")]
    shamir_threshold: usize,
    #[serde(default, deserialize_with = "lenient_string")]
    lastmodified: String,
    #[serde(default, deserialize_with = "lenient_string")]
    mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encrypted_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unencrypted_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encrypted_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unencrypted_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "is_false", deserialize_with = "lenient_bool")]
    mac_only_encrypted: bool,
    #[serde(default, deserialize_with = "lenient_string")]
    version: String,
}

#[allow(
    clippy::trivially_copy_pass_by_ref,
    reason = "serde skip_serializing_if passes by reference"
)]
fn is_zero(value: &usize) -> bool {
    *value == 0
}

#[allow(
    clippy::trivially_copy_pass_by_ref,
    reason = "serde skip_serializing_if passes by reference"
)]
fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Bool(bool),
    Int(u64),
    Float(f64),
    String(String),
}

fn lenient_usize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    match Lenient::deserialize(deserializer)? {
        Lenient::Int(n) => usize::try_from(n).map_err(serde::de::Error::custom),
        Lenient::String(s) if s.is_empty() => Ok(0),
        Lenient::String(s) => s.parse().map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom("expected an integer")),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Lenient::deserialize(deserializer)? {
        Lenient::Bool(b) => Ok(b),
        Lenient::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            _ => Err(serde::de::Error::custom(format!("invalid bool '{s}'"))),
        },
        _ => Err(serde::de::Error::custom("expected a boolean")),
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Lenient::deserialize(deserializer)? {
        Lenient::Bool(b) => b.to_string(),
        Lenient::Int(n) => n.to_string(),
        Lenient::Float(f) => f.to_string(),
        Lenient::String(s) => s,
    })
}

impl TryFrom<MetadataDoc> for Metadata {
    type Error = SopsError;

    fn try_from(doc: MetadataDoc) -> Result<Self, Self::Error> {
        let selectors = [
            doc.encrypted_regex.as_deref().map(|p| ("encrypted_regex", p)),
            doc.unencrypted_regex.as_deref().map(|p| ("unencrypted_regex", p)),
            doc.encrypted_suffix.as_deref().map(|p| ("encrypted_suffix", p)),
            doc.unencrypted_suffix.as_deref().map(|p| ("unencrypted_suffix", p)),
        ];
        let mut set = selectors.into_iter().flatten();
        let selector = match (set.next(), set.next()) {
            (None, _) => FieldSelector::default(),
            (Some(_), Some(_)) => {
                return Err(SopsError::Metadata(
                    "only one of encrypted_regex, unencrypted_regex, encrypted_suffix and \
                     unencrypted_suffix may be set"
                        .to_string(),
                ))
            }
            (Some(("encrypted_regex", pattern)), None) => FieldSelector::encrypted_regex(pattern)?,
            (Some(("unencrypted_regex", pattern)), None) => Regex::new(pattern)
                .map(FieldSelector::UnencryptedRegex)
                .map_err(|e| SopsError::Metadata(format!("invalid unencrypted_regex: {e}")))?,
            (Some(("encrypted_suffix", suffix)), None) => {
                FieldSelector::EncryptedSuffix(suffix.to_string())
            }
            (Some((_, suffix)), None) => FieldSelector::UnencryptedSuffix(suffix.to_string()),
        };

        let key_groups = if doc.key_groups.is_empty() {
            if doc.slots.is_empty() {
                Vec::new()
            } else {
                vec![KeyGroup::from(doc.slots)]
            }
        } else {
            doc.key_groups.into_iter().map(KeyGroup::from).collect()
        };

        Ok(Metadata {
            key_groups,
            shamir_threshold: doc.shamir_threshold,
            last_modified: doc.lastmodified,
            mac: doc.mac,
            selector,
            mac_only_encrypted: doc.mac_only_encrypted,
            version: doc.version,
        })
    }
}

impl From<&Metadata> for MetadataDoc {
    fn from(metadata: &Metadata) -> Self {
        let mut doc = MetadataDoc {
            shamir_threshold: metadata.shamir_threshold,
            lastmodified: metadata.last_modified.clone(),
            mac: metadata.mac.clone(),
            mac_only_encrypted: metadata.mac_only_encrypted,
            version: metadata.version.clone(),
            ..MetadataDoc::default()
        };
        match metadata.key_groups.as_slice() {
            [] => {}
            [group] => doc.slots = KeySlots::from(group),
            groups => doc.key_groups = groups.iter().map(KeySlots::from).collect(),
        }
        match &metadata.selector {
            FieldSelector::UnencryptedSuffix(s) => doc.unencrypted_suffix = Some(s.clone()),
            FieldSelector::EncryptedSuffix(s) => doc.encrypted_suffix = Some(s.clone()),
            FieldSelector::UnencryptedRegex(re) => {
                doc.unencrypted_regex = Some(re.as_str().to_string());
            }
            FieldSelector::EncryptedRegex(re) => {
                doc.encrypted_regex = Some(re.as_str().to_string());
            }
        }
        doc
    }
}
