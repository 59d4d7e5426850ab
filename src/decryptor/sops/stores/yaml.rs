//! YAML store.
//!
//! Emits block style with four-space indentation, keeping key order. A
//! string is written plain only if YAML reads it back as the same string;
//! multi-line strings become literal blocks, everything else is quoted.

use super::Store;
use crate::decryptor::format::Format;
use crate::decryptor::sops::tree::{Map, Value};
use crate::decryptor::sops::SopsError;

const INDENT: usize = 4;

#[derive(Debug)]
pub(super) struct YamlStore;

impl Store for YamlStore {
    fn format(&self) -> Format {
        Format::Yaml
    }

    fn load_plain(&self, buf: &[u8]) -> Result<Map, SopsError> {
        let load_err = |reason: String| SopsError::LoadPlain {
            format: Format::Yaml,
            reason,
        };
        let value: serde_yaml::Value =
            serde_yaml::from_slice(buf).map_err(|e| load_err(e.to_string()))?;
        match Value::try_from(value).map_err(load_err)? {
            Value::Map(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            _ => Err(load_err("top-level value must be a mapping".to_string())),
        }
    }

    fn emit_plain(&self, tree: &Map) -> Result<Vec<u8>, SopsError> {
        Ok(emit(tree).into_bytes())
    }
}

/// Emit a document
pub(crate) fn emit(tree: &Map) -> String {
    let mut out = String::new();
    if tree.is_empty() {
        out.push_str("{}\n");
    } else {
        emit_map(&mut out, tree, 0, false);
    }
    out
}

fn pad(out: &mut String, indent: usize) {
    out.push_str(&" ".repeat(indent));
}

/// `inline_first` continues the current line (after a `- ` sequence marker)
fn emit_map(out: &mut String, map: &Map, indent: usize, inline_first: bool) {
    for (index, (key, value)) in map.iter().enumerate() {
        if !(inline_first && index == 0) {
            pad(out, indent);
        }
        out.push_str(&scalar_string(key));
        out.push(':');
        match value {
            Value::Map(child) if !child.is_empty() => {
                out.push('\n');
                emit_map(out, child, indent + INDENT, false);
            }
            Value::Seq(items) if !items.is_empty() => {
                out.push('\n');
                emit_seq(out, items, indent + INDENT, false);
            }
            Value::String(s) if use_literal(s) => {
                out.push(' ');
                emit_literal(out, s, indent + INDENT);
            }
            scalar => {
                out.push(' ');
                out.push_str(&emit_scalar(scalar));
                out.push('\n');
            }
        }
    }
}

fn emit_seq(out: &mut String, items: &[Value], indent: usize, inline_first: bool) {
    for (index, item) in items.iter().enumerate() {
        if !(inline_first && index == 0) {
            pad(out, indent);
        }
        out.push_str("- ");
        let content = indent + 2;
        match item {
            Value::Map(child) if !child.is_empty() => emit_map(out, child, content, true),
            Value::Seq(nested) if !nested.is_empty() => emit_seq(out, nested, content, true),
            Value::String(s) if use_literal(s) => emit_literal(out, s, content),
            scalar => {
                out.push_str(&emit_scalar(scalar));
                out.push('\n');
            }
        }
    }
}

fn emit_scalar(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format_float(*f),
        Value::String(s) => scalar_string(s),
        Value::Map(_) => "{}".to_string(),
        Value::Seq(_) => "[]".to_string(),
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        ".nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { ".inf" } else { "-.inf" }.to_string()
    } else {
        let text = f.to_string();
        if text.contains(['.', 'e', 'E']) {
            text
        } else {
            format!("{text}.0")
        }
    }
}

/// Plain when it reads back as the same string, otherwise double quoted
fn scalar_string(s: &str) -> String {
    if is_plain_safe(s) {
        s.to_string()
    } else {
        // JSON strings are valid YAML double-quoted scalars
        serde_json::Value::String(s.to_string()).to_string()
    }
}

fn is_plain_safe(s: &str) -> bool {
    if s.is_empty() || s.trim() != s || s.chars().any(char::is_control) {
        return false;
    }
    matches!(
        serde_yaml::from_str::<serde_yaml::Value>(s),
        Ok(serde_yaml::Value::String(ref parsed)) if parsed == s
    )
}

fn use_literal(s: &str) -> bool {
    if !s.contains('\n') || s.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
        return false;
    }
    // Indentation of a literal block is taken from its first non-empty line
    s.lines()
        .find(|line| !line.is_empty())
        .is_some_and(|line| !line.starts_with([' ', '\t']))
}

fn emit_literal(out: &mut String, s: &str, indent: usize) {
    let (header, body) = match s.strip_suffix('\n') {
        Some(stripped) if stripped.ends_with('\n') => ("|+", stripped),
        Some(stripped) => ("|", stripped),
        None => ("|-", s),
    };
    out.push_str(header);
    out.push('\n');
    for line in body.split('\n') {
        if !line.is_empty() {
            pad(out, indent);
            out.push_str(line);
        }
        out.push('\n');
    }
}
