//! age (X25519) master keys.
//!
//! The data key is sealed as an ASCII-armored age payload bound to one
//! recipient. Unsealing is local and uses bounded reads, since a SOPS data
//! key is only 32 bytes.

use std::io::{Read, Write};

use age::armor::{ArmoredReader, ArmoredWriter, Format as ArmorFormat};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_UNSEALED_KEY_SIZE;
use crate::decryptor::error::{Backend, SopsError, UnsealError};
use crate::decryptor::sops::DataKey;

/// `age` entry of SOPS metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeKey {
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub enc: String,
}

impl AgeKey {
    /// Unsealed stanza for `recipient`, ready to seal a data key
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            enc: String::new(),
        }
    }

    /// Whether one of `identities` is the recipient of this stanza
    pub(crate) fn matches_any(&self, identities: &[age::x25519::Identity]) -> bool {
        if self.recipient.is_empty() {
            return !identities.is_empty();
        }
        identities
            .iter()
            .any(|identity| identity.to_public().to_string() == self.recipient)
    }

    pub(crate) fn unseal(
        &self,
        identities: &[age::x25519::Identity],
    ) -> Result<Vec<u8>, UnsealError> {
        let failed = |reason: String| UnsealError::failed(Backend::Age, reason);

        let decryptor = age::Decryptor::new_buffered(ArmoredReader::new(self.enc.as_bytes()))
            .map_err(|e| failed(format!("failed to parse age payload: {e}")))?;
        if decryptor.is_scrypt() {
            return Err(failed("passphrase-encrypted payloads are not supported".to_string()));
        }
        let reader = decryptor
            .decrypt(identities.iter().map(|identity| identity as &dyn age::Identity))
            .map_err(|e| failed(format!("failed to decrypt data key: {e}")))?;

        let mut plaintext = Vec::new();
        reader
            .take(MAX_UNSEALED_KEY_SIZE as u64 + 1)
            .read_to_end(&mut plaintext)
            .map_err(|e| failed(format!("failed to read data key: {e}")))?;
        if plaintext.len() > MAX_UNSEALED_KEY_SIZE {
            return Err(failed(format!(
                "unsealed payload exceeds {MAX_UNSEALED_KEY_SIZE} bytes"
            )));
        }
        Ok(plaintext)
    }

    pub(crate) fn seal(&self, key: &DataKey) -> Result<AgeKey, SopsError> {
        let recipient: age::x25519::Recipient = self
            .recipient
            .parse()
            .map_err(|e| {
                SopsError::Seal(format!("invalid age recipient '{}': {e}", self.recipient))
            })?;
        let encryptor =
            age::Encryptor::with_recipients(std::iter::once(&recipient as &dyn age::Recipient))
                .map_err(|e| SopsError::Seal(e.to_string()))?;

        let seal_err = |e: std::io::Error| SopsError::Seal(e.to_string());
        let mut sealed = Vec::new();
        let armor =
            ArmoredWriter::wrap_output(&mut sealed, ArmorFormat::AsciiArmor).map_err(seal_err)?;
        let mut writer = encryptor.wrap_output(armor).map_err(seal_err)?;
        writer.write_all(key.as_bytes()).map_err(seal_err)?;
        writer.finish().and_then(ArmoredWriter::finish).map_err(seal_err)?;

        Ok(AgeKey {
            recipient: self.recipient.clone(),
            enc: String::from_utf8(sealed).map_err(|e| SopsError::Seal(e.to_string()))?,
        })
    }
}

/// Parse every identity in an `.agekey` file. Blank lines and `#` comments
/// are skipped; at least one identity is required.
pub(crate) fn parse_identities(text: &str) -> Result<Vec<age::x25519::Identity>, String> {
    let identities = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .map(|(index, line)| {
            line.parse::<age::x25519::Identity>()
                .map_err(|e| format!("invalid age identity #{}: {e}", index + 1))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if identities.is_empty() {
        return Err("no age identities found".to_string());
    }
    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use age::secrecy::ExposeSecret;

    #[test]
    fn test_seal_unseal() {
        let identity = age::x25519::Identity::generate();
        let key = DataKey::generate();
        let sealed = AgeKey::new(identity.to_public().to_string()).seal(&key).unwrap();
        assert!(sealed.enc.starts_with("-----BEGIN AGE ENCRYPTED FILE-----"));

        let identities = vec![identity];
        assert!(sealed.matches_any(&identities));
        assert_eq!(sealed.unseal(&identities).unwrap(), key.as_bytes());
    }

    #[test]
    fn test_unseal_with_wrong_identity() {
        let recipient = age::x25519::Identity::generate().to_public().to_string();
        let sealed = AgeKey::new(recipient).seal(&DataKey::generate()).unwrap();
        let other = vec![age::x25519::Identity::generate()];
        assert!(!sealed.matches_any(&other));
        assert!(matches!(
            sealed.unseal(&other),
            Err(UnsealError::Failed { backend: Backend::Age, .. })
        ));
    }

    #[test]
    fn test_seal_with_invalid_recipient() {
        assert!(matches!(
            AgeKey::new("not-a-recipient").seal(&DataKey::generate()),
            Err(SopsError::Seal(_))
        ));
    }

    #[test]
    fn test_parse_identities() {
        let first = age::x25519::Identity::generate();
        let second = age::x25519::Identity::generate();
        let text = format!(
            "# created: 2024-01-01\n# public key: {}\n{}\n\n{}\n",
            first.to_public(),
            first.to_string().expose_secret(),
            second.to_string().expose_secret()
        );
        assert_eq!(parse_identities(&text).unwrap().len(), 2);
    }

    #[test]
    fn test_parse_identities_errors() {
        assert!(parse_identities("AGE-SECRET-KEY-invalid\n").is_err());
        assert_eq!(
            parse_identities("# only a comment\n").err().as_deref(),
            Some("no age identities found")
        );
    }
}
