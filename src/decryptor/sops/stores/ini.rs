//! INI store.
//!
//! Sections map to top-level keys, entries to string values. SOPS metadata
//! lives in a trailing `[sops]` section with flattened keys; newlines in
//! metadata values (armored age and PGP payloads) are escaped as `\n`.

use super::{flatten, unflatten, Store};
use crate::constants::SOPS_METADATA_KEY;
use crate::decryptor::format::Format;
use crate::decryptor::sops::tree::{Map, Value};
use crate::decryptor::sops::SopsError;

#[derive(Debug)]
pub(super) struct IniStore;

impl Store for IniStore {
    fn format(&self) -> Format {
        Format::Ini
    }

    fn load_plain(&self, buf: &[u8]) -> Result<Map, SopsError> {
        parse(buf).map_err(|reason| SopsError::LoadPlain {
            format: Format::Ini,
            reason,
        })
    }

    fn emit_plain(&self, tree: &Map) -> Result<Vec<u8>, SopsError> {
        emit(tree).map(String::into_bytes).map_err(|reason| SopsError::Emit {
            format: Format::Ini,
            reason,
        })
    }

    fn load_encrypted(&self, buf: &[u8]) -> Result<(Map, Value), SopsError> {
        let mut tree = parse(buf).map_err(|reason| SopsError::Load {
            format: Format::Ini,
            reason,
        })?;
        let Some(Value::Map(section)) = tree.remove(SOPS_METADATA_KEY) else {
            return Err(SopsError::MetadataNotFound);
        };
        let pairs = section
            .into_iter()
            .map(|(k, v)| (k, v.scalar_text().unwrap_or_default().replace("\\n", "\n")))
            .collect();
        Ok((tree, unflatten(pairs)?))
    }

    fn emit_encrypted(&self, tree: &Map, metadata: &Value) -> Result<Vec<u8>, SopsError> {
        let section: Map = flatten(metadata)
            .into_iter()
            .map(|(k, v)| (k, Value::String(v.replace('\n', "\\n"))))
            .collect();
        let mut tree = tree.clone();
        tree.insert(SOPS_METADATA_KEY, Value::Map(section));
        self.emit_plain(&tree)
    }
}

fn parse(buf: &[u8]) -> Result<Map, String> {
    let text = std::str::from_utf8(buf).map_err(|e| format!("invalid UTF-8: {e}"))?;
    let mut tree = Map::new();
    let mut section: Option<String> = None;

    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            if tree.get(&name).is_none() {
                tree.insert(name.clone(), Value::Map(Map::new()));
            }
            section = Some(name);
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: expected 'key = value'", number + 1))?;
        let entry = (key.trim().to_string(), Value::String(value.trim().to_string()));
        match &section {
            Some(name) => {
                if let Some(Value::Map(map)) = tree.get_mut(name) {
                    map.insert(entry.0, entry.1);
                }
            }
            None => tree.insert(entry.0, entry.1),
        }
    }
    Ok(tree)
}

fn emit(tree: &Map) -> Result<String, String> {
    let mut out = String::new();
    // Keys outside any section must come first
    for (key, value) in tree.iter().filter(|(_, v)| !matches!(v, Value::Map(_))) {
        let text = value
            .scalar_text()
            .ok_or_else(|| format!("value of '{key}' cannot be represented in INI"))?;
        out.push_str(&format!("{key} = {text}\n"));
    }
    for (name, value) in tree.iter() {
        let Value::Map(section) = value else {
            continue;
        };
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("[{name}]\n"));
        for (key, value) in section.iter() {
            let text = value.scalar_text().ok_or_else(|| {
                format!("INI supports a single level of nesting, '{name}.{key}' is nested")
            })?;
            out.push_str(&format!("{key} = {text}\n"));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let text = "[config]\napp = secret\n\n[other]\nkey = value with = sign\n";
        let tree = IniStore.load_plain(text.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(IniStore.emit_plain(&tree).unwrap()).unwrap(), text);
    }

    #[test]
    fn test_comments_and_global_keys() {
        let tree = IniStore
            .load_plain(b"; comment\nglobal = 1\n# another\n[s]\n  k =  v  \n")
            .unwrap();
        assert_eq!(tree.get("global"), Some(&Value::String("1".to_string())));
        let Some(Value::Map(section)) = tree.get("s") else {
            panic!("expected section");
        };
        assert_eq!(section.get("k"), Some(&Value::String("v".to_string())));
    }

    #[test]
    fn test_invalid_line() {
        assert!(IniStore.load_plain(b"[s]\nnot a pair\n").is_err());
    }

    #[test]
    fn test_nested_values_cannot_be_emitted() {
        let mut inner = Map::new();
        inner.insert("deep", Value::Map(Map::new()));
        let mut tree = Map::new();
        tree.insert("s", Value::Map(inner));
        assert!(matches!(IniStore.emit_plain(&tree), Err(SopsError::Emit { .. })));
    }

    #[test]
    fn test_metadata_section() {
        let mut metadata = Map::new();
        metadata.insert("mac", Value::String("ENC[x]".to_string()));
        metadata.insert("enc", Value::String("-----BEGIN AGE-----\nabc\n".to_string()));
        let mut tree = Map::new();
        let mut section = Map::new();
        section.insert("app", Value::String("ENC[y]".to_string()));
        tree.insert("config", Value::Map(section));

        let bytes = IniStore
            .emit_encrypted(&tree, &Value::Map(metadata.clone()))
            .unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            "[config]\napp = ENC[y]\n\n[sops]\nmac = ENC[x]\nenc = -----BEGIN AGE-----\\nabc\\n\n"
        );
        let (loaded, loaded_metadata) = IniStore.load_encrypted(&bytes).unwrap();
        assert_eq!(loaded, tree);
        assert_eq!(loaded_metadata, Value::Map(metadata));
    }
}
