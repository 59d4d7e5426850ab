//! Scrubbing of MAC values from integrity errors.
//!
//! A malformed MAC may be secret material pasted into the wrong place, so its
//! value never reaches logs or resource status.

use std::sync::LazyLock;

use regex::Regex;

use crate::constants::REDACTED_MARKER;

static MAC_INPUT_STRING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(input string )(.+)( does not match sops' data format)")
        .expect("MAC redaction pattern is a valid regex - this should never happen")
});

/// Replace the value captured between the fixed phrases with the redaction marker.
/// Messages without both phrases are returned unchanged.
pub fn redact_mac_error(message: &str) -> String {
    MAC_INPUT_STRING
        .replace_all(message, format!("${{1}}{REDACTED_MARKER}${{3}}"))
        .into_owned()
}

/// Pass a decrypted MAC through, or return its error with the value redacted
pub fn safe_decrypt(result: Result<String, String>) -> Result<String, String> {
    result.map_err(|err| redact_mac_error(&err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_value() {
        assert_eq!(
            redact_mac_error("Input string 1234567897 does not match sops' data format"),
            "Input string <redacted> does not match sops' data format"
        );
    }

    #[test]
    fn test_is_case_insensitive() {
        assert_eq!(
            redact_mac_error("input STRING abc DOES NOT match SOPS' data format"),
            "input STRING <redacted> DOES NOT match SOPS' data format"
        );
    }

    #[test]
    fn test_prefix_only_is_unchanged() {
        let message = "Input string was not in a correct format";
        assert_eq!(redact_mac_error(message), message);
    }

    #[test]
    fn test_suffix_only_is_unchanged() {
        let message = "The value does not match sops' data format";
        assert_eq!(redact_mac_error(message), message);
    }

    #[test]
    fn test_safe_decrypt_passes_mac_through() {
        assert_eq!(
            safe_decrypt(Ok("DEADBEEF".to_string())),
            Ok("DEADBEEF".to_string())
        );
        assert_eq!(
            safe_decrypt(Err(
                "Input string 1234567897 does not match sops' data format".to_string()
            )),
            Err("Input string <redacted> does not match sops' data format".to_string())
        );
    }
}
