//! # Format Resolution
//!
//! Maps file names to SOPS store formats and sniffs the format of an
//! encrypted document from its marker bytes.
//!
//! A file's extension only says how the *plaintext* should look. Data that
//! went through other tooling (a Secret data field, a generator source with a
//! misleading name) may have been encrypted with a different store, so the
//! input format of an encrypted document is always taken from its markers.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::constants::{DOCKER_CONFIG_JSON_KEY, SOPS_METADATA_KEY};

/// SOPS store format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Yaml,
    Json,
    Ini,
    Dotenv,
    Binary,
    Unsupported,
}

/// Formats in marker detection order.
/// Binary shares its marker with JSON and is told apart by [`is_binary_envelope`].
const DETECTION_ORDER: [Format; 4] = [Format::Yaml, Format::Json, Format::Dotenv, Format::Ini];

impl Format {
    /// Literal bytes present in every document encrypted with this store
    pub fn marker(self) -> Option<&'static [u8]> {
        match self {
            Format::Yaml => Some(b"mac: ENC["),
            Format::Json | Format::Binary => Some(br#""mac": "ENC["#),
            Format::Dotenv => Some(b"sops_mac=ENC["),
            Format::Ini => Some(b"[sops]"),
            Format::Unsupported => None,
        }
    }

    /// Whether `buf` carries this format's marker
    pub fn has_marker(self, buf: &[u8]) -> bool {
        self.marker().is_some_and(|marker| contains(buf, marker))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Yaml => "YAML",
            Format::Json => "JSON",
            Format::Ini => "INI",
            Format::Dotenv => "dotenv",
            Format::Binary => "binary",
            Format::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(Format::Yaml),
            "json" => Ok(Format::Json),
            "ini" => Ok(Format::Ini),
            "dotenv" | "env" => Ok(Format::Dotenv),
            "binary" => Ok(Format::Binary),
            other => Err(format!("unknown format '{other}'")),
        }
    }
}

/// Output format for a file or Secret data key.
///
/// The `.dockerconfigjson` key carries the DockerConfigJSON format, which has
/// no store of its own and is read and written as [`Format::Json`]. Known
/// extensions map to their store and anything else is treated as YAML.
pub fn format_for_path(name: &str) -> Format {
    let path = Path::new(name);
    if path.file_name().and_then(|n| n.to_str()) == Some(DOCKER_CONFIG_JSON_KEY) {
        return Format::Json;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Format::Json,
        Some("env") => Format::Dotenv,
        Some("ini") => Format::Ini,
        _ => Format::Yaml,
    }
}

/// Detect the store format of an encrypted document from its marker bytes.
///
/// Returns [`Format::Unsupported`] when no marker is present, which means the
/// data is not SOPS encrypted (or not in a store this crate reads).
pub fn detect_format_from_marker_bytes(buf: &[u8]) -> Format {
    DETECTION_ORDER
        .into_iter()
        .find(|format| format.has_marker(buf))
        .unwrap_or(Format::Unsupported)
}

/// Whether an encrypted JSON document is a binary store envelope,
/// i.e. `{"data": "...", "sops": {...}}` and nothing else.
pub fn is_binary_envelope(buf: &[u8]) -> bool {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(buf) else {
        return false;
    };
    map.len() == 2
        && map.get("data").is_some_and(serde_json::Value::is_string)
        && map.get(SOPS_METADATA_KEY).is_some_and(serde_json::Value::is_object)
}

/// Input and output formats for decrypting `buf`, named `name`.
///
/// The input format is sniffed from the marker bytes. The output format is
/// [`Format::Binary`] for binary envelopes, and follows the name otherwise.
pub fn formats_for_encrypted(name: &str, buf: &[u8]) -> (Format, Format) {
    let input = detect_format_from_marker_bytes(buf);
    let output = if input == Format::Json && is_binary_envelope(buf) {
        Format::Binary
    } else {
        format_for_path(name)
    };
    (input, output)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}
