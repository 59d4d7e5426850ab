//! # Decryptor Configuration
//!
//! Decryptor-level settings loaded from environment variables.

use std::time::Duration;

/// Decryptor configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct DecryptorConfig {
    /// Maximum encrypted file size (bytes)
    /// Larger files are rejected before they are read
    pub max_file_size: u64,
    /// Timeout for a single KMS/Vault/Key Vault unseal call (seconds)
    pub unseal_timeout_secs: u64,
    /// gpg binary used for PGP unsealing
    /// Resolved through `PATH` when it is not an absolute path
    pub gpg_binary: String,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Enable metrics collection
    pub enable_metrics: bool,
}

impl Default for DecryptorConfig {
    fn default() -> Self {
        use crate::constants::{
            DEFAULT_GPG_BINARY, DEFAULT_MAX_ENCRYPTED_FILE_SIZE, DEFAULT_UNSEAL_TIMEOUT_SECS,
        };
        Self {
            max_file_size: DEFAULT_MAX_ENCRYPTED_FILE_SIZE,
            unseal_timeout_secs: DEFAULT_UNSEAL_TIMEOUT_SECS,
            gpg_binary: DEFAULT_GPG_BINARY.to_string(),
            log_level: "INFO".to_string(),
            enable_metrics: true,
        }
    }
}

impl DecryptorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::{
            DEFAULT_GPG_BINARY, DEFAULT_MAX_ENCRYPTED_FILE_SIZE, DEFAULT_UNSEAL_TIMEOUT_SECS,
        };
        Self {
            max_file_size: env_var_or_default(
                "SOPS_MAX_FILE_SIZE",
                DEFAULT_MAX_ENCRYPTED_FILE_SIZE,
            ),
            unseal_timeout_secs: env_var_or_default(
                "SOPS_KMS_TIMEOUT_SECS",
                DEFAULT_UNSEAL_TIMEOUT_SECS,
            ),
            gpg_binary: env_var_or_default_str("SOPS_GPG_BINARY", DEFAULT_GPG_BINARY),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            enable_metrics: env_var_or_default_bool("ENABLE_METRICS", true),
        }
    }

    /// Get unseal timeout duration
    pub fn unseal_timeout(&self) -> Duration {
        Duration::from_secs(self.unseal_timeout_secs)
    }

    /// Override the maximum encrypted file size
    #[must_use]
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let v_lower = v.to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DecryptorConfig::default();
        assert_eq!(config.max_file_size, 5 * 1024 * 1024);
        assert_eq!(config.unseal_timeout(), Duration::from_secs(30));
        assert_eq!(config.gpg_binary, "gpg");
    }

    #[test]
    fn test_with_max_file_size() {
        let config = DecryptorConfig::default().with_max_file_size(1024);
        assert_eq!(config.max_file_size, 1024);
    }

    #[test]
    fn test_env_var_or_default_falls_back_on_garbage() {
        // Unlikely to be set by anything else in the test process
        std::env::set_var("KUSTOMIZE_DECRYPTOR_TEST_GARBAGE", "not-a-number");
        let value: u64 = env_var_or_default("KUSTOMIZE_DECRYPTOR_TEST_GARBAGE", 7);
        assert_eq!(value, 7);
        std::env::remove_var("KUSTOMIZE_DECRYPTOR_TEST_GARBAGE");
    }
}
