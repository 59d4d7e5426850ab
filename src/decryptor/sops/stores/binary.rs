//! Binary store.
//!
//! The plaintext is opaque and held as a single `data` string. Encrypted,
//! it travels as a JSON envelope `{"data": "ENC[...]", "sops": {...}}`.

use super::{Store, JSON};
use crate::constants::BINARY_DATA_KEY;
use crate::decryptor::format::Format;
use crate::decryptor::sops::tree::{Map, Value};
use crate::decryptor::sops::SopsError;

#[derive(Debug)]
pub(super) struct BinaryStore;

impl Store for BinaryStore {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load_plain(&self, buf: &[u8]) -> Result<Map, SopsError> {
        let text = String::from_utf8(buf.to_vec()).map_err(|e| SopsError::LoadPlain {
            format: Format::Binary,
            reason: format!("binary data must be valid UTF-8: {e}"),
        })?;
        let mut tree = Map::new();
        tree.insert(BINARY_DATA_KEY, Value::String(text));
        Ok(tree)
    }

    fn emit_plain(&self, tree: &Map) -> Result<Vec<u8>, SopsError> {
        match tree.get(BINARY_DATA_KEY) {
            Some(Value::String(data)) => Ok(data.clone().into_bytes()),
            _ => Err(SopsError::Emit {
                format: Format::Binary,
                reason: format!("no string '{BINARY_DATA_KEY}' key found"),
            }),
        }
    }

    fn load_encrypted(&self, buf: &[u8]) -> Result<(Map, Value), SopsError> {
        JSON.load_encrypted(buf).map_err(|err| match err {
            SopsError::Load { reason, .. } => SopsError::Load {
                format: Format::Binary,
                reason,
            },
            other => other,
        })
    }

    fn emit_encrypted(&self, tree: &Map, metadata: &Value) -> Result<Vec<u8>, SopsError> {
        JSON.emit_encrypted(tree, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_is_opaque() {
        let raw = b"{\"not\": \"parsed\"}\n";
        let tree = BinaryStore.load_plain(raw).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(BinaryStore.emit_plain(&tree).unwrap(), raw);
    }

    #[test]
    fn test_non_utf8_is_rejected() {
        assert!(BinaryStore.load_plain(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_envelope() {
        let mut tree = Map::new();
        tree.insert(BINARY_DATA_KEY, Value::String("ENC[d]".to_string()));
        let mut metadata = Map::new();
        metadata.insert("mac", Value::String("ENC[m]".to_string()));

        let bytes = BinaryStore
            .emit_encrypted(&tree, &Value::Map(metadata.clone()))
            .unwrap();
        let (loaded, loaded_metadata) = BinaryStore.load_encrypted(&bytes).unwrap();
        assert_eq!(loaded, tree);
        assert_eq!(loaded_metadata, Value::Map(metadata));
    }

    #[test]
    fn test_emit_without_data() {
        assert!(matches!(
            BinaryStore.emit_plain(&Map::new()),
            Err(SopsError::Emit { .. })
        ));
    }
}
