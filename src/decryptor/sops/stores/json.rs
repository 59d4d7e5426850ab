//! JSON store, tab-indented with a trailing newline.

use serde::Serialize;

use super::Store;
use crate::decryptor::format::Format;
use crate::decryptor::sops::tree::{Map, Value};
use crate::decryptor::sops::SopsError;

#[derive(Debug)]
pub(super) struct JsonStore;

impl Store for JsonStore {
    fn format(&self) -> Format {
        Format::Json
    }

    fn load_plain(&self, buf: &[u8]) -> Result<Map, SopsError> {
        let value: serde_json::Value =
            serde_json::from_slice(buf).map_err(|e| SopsError::LoadPlain {
                format: Format::Json,
                reason: e.to_string(),
            })?;
        match Value::from(value) {
            Value::Map(map) => Ok(map),
            _ => Err(SopsError::LoadPlain {
                format: Format::Json,
                reason: "top-level value must be an object".to_string(),
            }),
        }
    }

    fn emit_plain(&self, tree: &Map) -> Result<Vec<u8>, SopsError> {
        let value = serde_json::Value::from(&Value::Map(tree.clone()));
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        value.serialize(&mut serializer).map_err(|e| SopsError::Emit {
            format: Format::Json,
            reason: e.to_string(),
        })?;
        out.push(b'\n');
        Ok(out)
    }
}
