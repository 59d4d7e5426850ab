//! # Stores
//!
//! One store per document format. A store parses bytes into the ordered tree
//! and emits a tree back out, with or without the SOPS metadata entry.
//!
//! Structured stores (YAML, JSON) keep metadata as a nested `sops` map. Flat
//! stores (INI, dotenv) cannot nest, so metadata is flattened into keys such
//! as `age__list_0__map_recipient`.

mod binary;
mod dotenv;
mod ini;
mod json;
mod yaml;

use std::sync::LazyLock;

use regex::Regex;

use super::tree::{Map, Value};
use super::SopsError;
use crate::constants::SOPS_METADATA_KEY;
use crate::decryptor::format::Format;

/// Parsing and emitting one document format
pub(crate) trait Store: Send + Sync {
    fn format(&self) -> Format;

    /// Parse a plaintext document
    fn load_plain(&self, buf: &[u8]) -> Result<Map, SopsError>;

    /// Emit a plaintext document
    fn emit_plain(&self, tree: &Map) -> Result<Vec<u8>, SopsError>;

    /// Parse an encrypted document into its tree and metadata subtree
    fn load_encrypted(&self, buf: &[u8]) -> Result<(Map, Value), SopsError> {
        let mut tree = self.load_plain(buf).map_err(|err| match err {
            SopsError::LoadPlain { format, reason } => SopsError::Load { format, reason },
            other => other,
        })?;
        let metadata = tree
            .remove(SOPS_METADATA_KEY)
            .ok_or(SopsError::MetadataNotFound)?;
        Ok((tree, metadata))
    }

    /// Emit an encrypted document with its metadata subtree
    fn emit_encrypted(&self, tree: &Map, metadata: &Value) -> Result<Vec<u8>, SopsError> {
        let mut tree = tree.clone();
        tree.insert(SOPS_METADATA_KEY, metadata.clone());
        self.emit_plain(&tree)
    }
}

static YAML: yaml::YamlStore = yaml::YamlStore;
static JSON: json::JsonStore = json::JsonStore;
static INI: ini::IniStore = ini::IniStore;
static DOTENV: dotenv::DotenvStore = dotenv::DotenvStore;
static BINARY: binary::BinaryStore = binary::BinaryStore;

/// Store implementing `format`
pub(crate) fn store_for(format: Format) -> Result<&'static dyn Store, SopsError> {
    match format {
        Format::Yaml => Ok(&YAML),
        Format::Json => Ok(&JSON),
        Format::Ini => Ok(&INI),
        Format::Dotenv => Ok(&DOTENV),
        Format::Binary => Ok(&BINARY),
        Format::Unsupported => Err(SopsError::UnsupportedFormat(format)),
    }
}

static FLAT_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("__(list|map)_")
        .expect("flattening separator is a valid regex - this should never happen")
});

/// Flatten a metadata subtree into `key=value` pairs for flat stores
pub(crate) fn flatten(value: &Value) -> Vec<(String, String)> {
    fn walk(value: &Value, prefix: &str, out: &mut Vec<(String, String)>) {
        match value {
            Value::Map(map) => {
                for (key, child) in map.iter() {
                    let name = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}__map_{key}")
                    };
                    walk(child, &name, out);
                }
            }
            Value::Seq(items) => {
                for (index, child) in items.iter().enumerate() {
                    walk(child, &format!("{prefix}__list_{index}"), out);
                }
            }
            scalar => {
                if let Some(text) = scalar.scalar_text() {
                    out.push((prefix.to_string(), text));
                }
            }
        }
    }

    let mut out = Vec::new();
    walk(value, "", &mut out);
    out
}

enum Step {
    Key(String),
    Index(usize),
}

/// Rebuild a metadata subtree from flattened pairs
pub(crate) fn unflatten(pairs: Vec<(String, String)>) -> Result<Value, SopsError> {
    let mut root = Value::Map(Map::new());
    for (key, value) in pairs {
        let mut steps = Vec::new();
        let mut last = 0;
        let mut pending_kind: Option<&str> = None;
        for captures in FLAT_SEPARATOR.captures_iter(&key) {
            let (Some(whole), Some(kind)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            steps.push(step(pending_kind, &key[last..whole.start()])?);
            pending_kind = Some(kind.as_str());
            last = whole.end();
        }
        steps.push(step(pending_kind, &key[last..])?);
        insert_path(&mut root, &steps, Value::String(value))?;
    }
    Ok(root)
}

fn step(kind: Option<&str>, text: &str) -> Result<Step, SopsError> {
    match kind {
        Some("list") => text
            .parse()
            .map(Step::Index)
            .map_err(|e| SopsError::Metadata(format!("invalid list index '{text}': {e}"))),
        _ => Ok(Step::Key(text.to_string())),
    }
}

fn insert_path(node: &mut Value, steps: &[Step], leaf: Value) -> Result<(), SopsError> {
    let Some((first, rest)) = steps.split_first() else {
        *node = leaf;
        return Ok(());
    };
    let fresh = || match rest.first() {
        Some(Step::Index(_)) => Value::Seq(Vec::new()),
        _ => Value::Map(Map::new()),
    };
    match (first, node) {
        (Step::Key(key), Value::Map(map)) => {
            if map.get(key).is_none() {
                map.insert(key.clone(), fresh());
            }
            let child = map
                .get_mut(key)
                .ok_or_else(|| SopsError::Metadata(format!("cannot insert '{key}'")))?;
            insert_path(child, rest, leaf)
        }
        (Step::Index(index), Value::Seq(items)) => {
            while items.len() <= *index {
                items.push(fresh());
            }
            insert_path(&mut items[*index], rest, leaf)
        }
        _ => Err(SopsError::Metadata(
            "flattened metadata mixes lists and maps at the same path".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_unflatten() {
        let mut stanza = Map::new();
        stanza.insert("recipient", Value::String("age1abc".to_string()));
        stanza.insert("enc", Value::String("-----BEGIN AGE-----\nxyz\n".to_string()));
        let mut metadata = Map::new();
        metadata.insert("age", Value::Seq(vec![Value::Map(stanza)]));
        metadata.insert("mac", Value::String("ENC[x]".to_string()));
        let metadata = Value::Map(metadata);

        let flat = flatten(&metadata);
        assert_eq!(
            flat,
            vec![
                ("age__list_0__map_recipient".to_string(), "age1abc".to_string()),
                ("age__list_0__map_enc".to_string(), "-----BEGIN AGE-----\nxyz\n".to_string()),
                ("mac".to_string(), "ENC[x]".to_string()),
            ]
        );
        assert_eq!(unflatten(flat).unwrap(), metadata);
    }

    #[test]
    fn test_unflatten_rejects_bad_index() {
        assert!(unflatten(vec![("age__list_x".to_string(), "v".to_string())]).is_err());
    }

    #[test]
    fn test_store_for_unsupported() {
        assert!(matches!(
            store_for(Format::Unsupported),
            Err(SopsError::UnsupportedFormat(Format::Unsupported))
        ));
        assert_eq!(store_for(Format::Ini).unwrap().format(), Format::Ini);
    }
}
