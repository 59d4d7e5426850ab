//! Dotenv store.
//!
//! One `KEY=value` per line. Newlines in values are escaped as `\n`.
//! Metadata keys are flattened and carry the `sops_` prefix.

use super::{flatten, unflatten, Store};
use crate::constants::SOPS_DOTENV_PREFIX;
use crate::decryptor::format::Format;
use crate::decryptor::sops::tree::{Map, Value};
use crate::decryptor::sops::SopsError;

#[derive(Debug)]
pub(super) struct DotenvStore;

impl Store for DotenvStore {
    fn format(&self) -> Format {
        Format::Dotenv
    }

    fn load_plain(&self, buf: &[u8]) -> Result<Map, SopsError> {
        parse(buf).map_err(|reason| SopsError::LoadPlain {
            format: Format::Dotenv,
            reason,
        })
    }

    fn emit_plain(&self, tree: &Map) -> Result<Vec<u8>, SopsError> {
        let mut out = String::new();
        for (key, value) in tree.iter() {
            let text = value.scalar_text().ok_or_else(|| SopsError::Emit {
                format: Format::Dotenv,
                reason: format!("value of '{key}' is not a scalar"),
            })?;
            out.push_str(key);
            out.push('=');
            out.push_str(&text.replace('\n', "\\n"));
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    fn load_encrypted(&self, buf: &[u8]) -> Result<(Map, Value), SopsError> {
        let parsed = parse(buf).map_err(|reason| SopsError::Load {
            format: Format::Dotenv,
            reason,
        })?;
        let mut tree = Map::new();
        let mut pairs = Vec::new();
        for (key, value) in parsed {
            match key.strip_prefix(SOPS_DOTENV_PREFIX) {
                Some(stripped) => {
                    pairs.push((stripped.to_string(), value.scalar_text().unwrap_or_default()));
                }
                None => tree.insert(key, value),
            }
        }
        if pairs.is_empty() {
            return Err(SopsError::MetadataNotFound);
        }
        Ok((tree, unflatten(pairs)?))
    }

    fn emit_encrypted(&self, tree: &Map, metadata: &Value) -> Result<Vec<u8>, SopsError> {
        let mut tree = tree.clone();
        for (key, value) in flatten(metadata) {
            tree.insert(format!("{SOPS_DOTENV_PREFIX}{key}"), Value::String(value));
        }
        self.emit_plain(&tree)
    }
}

fn parse(buf: &[u8]) -> Result<Map, String> {
    let text = std::str::from_utf8(buf).map_err(|e| format!("invalid UTF-8: {e}"))?;
    let mut tree = Map::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: expected 'KEY=value'", number + 1))?;
        if key.is_empty() {
            return Err(format!("line {}: empty key", number + 1));
        }
        tree.insert(key, Value::String(value.replace("\\n", "\n")));
    }
    Ok(tree)
}
