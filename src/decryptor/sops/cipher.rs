//! AES-256-GCM value encryption.
//!
//! Encrypted values have the format:
//! `ENC[AES256_GCM,data:<base64>,iv:<base64>,tag:<base64>,type:<kind>]`
//!
//! The additional authenticated data binds each value to its position in the
//! document, so values cannot be swapped between keys.

use std::fmt;

use aes_gcm::aead::consts::U32;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{Aes256Gcm, AesGcm};
use base64::Engine;
use zeroize::Zeroizing;

/// AES-256-GCM with the 32-byte nonce SOPS writes
type SopsGcm = AesGcm<Aes256, U32>;

const CIPHER_NAME: &str = "AES256_GCM";
const TAG_LEN: usize = 16;
const IV_LEN: usize = 32;
const LEGACY_IV_LEN: usize = 12;

/// Length of a SOPS data key
pub const DATA_KEY_LEN: usize = 32;

/// The symmetric key every value of a document is encrypted with
pub struct DataKey(Zeroizing<Vec<u8>>);

impl DataKey {
    /// Fresh random data key
    pub fn generate() -> Self {
        let mut key = Zeroizing::new(vec![0u8; DATA_KEY_LEN]);
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Wrap unsealed key bytes, checking their length
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, String> {
        let bytes = Zeroizing::new(bytes);
        if bytes.len() != DATA_KEY_LEN {
            return Err(format!(
                "data key has wrong length: {} (expected {DATA_KEY_LEN})",
                bytes.len()
            ));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// Whether a string looks like an encrypted value
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with("ENC[") && value.ends_with(']')
}

/// Decrypt an `ENC[...]` value. Returns the plaintext and its type tag.
pub fn decrypt_value(
    encrypted: &str,
    key: &DataKey,
    aad: &str,
) -> Result<(Vec<u8>, String), String> {
    let inner = encrypted
        .strip_prefix("ENC[")
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| format!("Input string {encrypted} does not match sops' data format"))?;

    let mut parts = inner.split(',');
    let cipher = parts.next().unwrap_or_default();
    if cipher != CIPHER_NAME {
        return Err(format!("unsupported cipher type: {cipher}"));
    }

    let (mut data, mut iv, mut tag, mut kind) = (None, None, None, "str");
    for part in parts {
        let (name, value) = part
            .split_once(':')
            .ok_or_else(|| format!("Input string {encrypted} does not match sops' data format"))?;
        match name {
            "data" => data = Some(value),
            "iv" => iv = Some(value),
            "tag" => tag = Some(value),
            "type" => kind = value,
            _ => {}
        }
    }

    let b64 = base64::engine::general_purpose::STANDARD;
    let decode = |field: &str, value: Option<&str>| -> Result<Vec<u8>, String> {
        let value = value.ok_or_else(|| format!("missing '{field}' in encrypted value"))?;
        b64.decode(value)
            .map_err(|e| format!("invalid base64 in {field}: {e}"))
    };
    let mut ciphertext = decode("data", data)?;
    let iv = decode("iv", iv)?;
    let tag = decode("tag", tag)?;
    if tag.len() != TAG_LEN {
        return Err(format!("invalid tag length: {} (expected {TAG_LEN})", tag.len()));
    }

    // The AEAD interface expects the tag appended to the ciphertext
    ciphertext.extend_from_slice(&tag);
    let payload = Payload {
        msg: &ciphertext,
        aad: aad.as_bytes(),
    };
    let plaintext = match iv.len() {
        IV_LEN => SopsGcm::new_from_slice(key.as_bytes())
            .map_err(|e| e.to_string())?
            .decrypt(GenericArray::from_slice(&iv), payload),
        LEGACY_IV_LEN => Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| e.to_string())?
            .decrypt(GenericArray::from_slice(&iv), payload),
        other => return Err(format!("invalid IV length: {other}")),
    }
    .map_err(|e| format!("could not decrypt value with AES_GCM: {e}"))?;

    Ok((plaintext, kind.to_string()))
}

/// Encrypt plaintext bytes into an `ENC[...]` value
pub fn encrypt_value(
    plaintext: &[u8],
    kind: &str,
    key: &DataKey,
    aad: &str,
) -> Result<String, String> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut sealed = SopsGcm::new_from_slice(key.as_bytes())
        .map_err(|e| e.to_string())?
        .encrypt(
            GenericArray::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| format!("could not encrypt value with AES_GCM: {e}"))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(format!(
        "ENC[{CIPHER_NAME},data:{},iv:{},tag:{},type:{kind}]",
        b64.encode(&sealed),
        b64.encode(iv),
        b64.encode(tag),
    ))
}
