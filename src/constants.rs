//! # Constants
//!
//! Shared constants used throughout the decryptor.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// The only decryption provider this engine acts on.
/// Kustomizations naming any other provider are left untouched.
pub const DECRYPTION_PROVIDER_SOPS: &str = "sops";

/// Suffix of Secret keys holding ASCII-armored PGP private keys
pub const PGP_KEY_SUFFIX: &str = ".asc";

/// Suffix of Secret keys holding age identities
pub const AGE_KEY_SUFFIX: &str = ".agekey";

/// Secret key holding a HashiCorp Vault token
pub const VAULT_TOKEN_KEY: &str = "sops.vault-token";

/// Secret key holding AWS KMS credentials (YAML)
pub const AWS_KMS_KEY: &str = "sops.aws-kms";

/// Secret key holding GCP KMS credentials (service account or authorized user JSON)
pub const GCP_KMS_KEY: &str = "sops.gcp-kms";

/// Secret key holding Azure Key Vault credentials (YAML or JSON)
pub const AZURE_KV_KEY: &str = "sops.azure-kv";

/// Default maximum size of an encrypted file (5 MiB)
pub const DEFAULT_MAX_ENCRYPTED_FILE_SIZE: u64 = 5 << 20;

/// Default timeout for a single network unseal call (seconds)
pub const DEFAULT_UNSEAL_TIMEOUT_SECS: u64 = 30;

/// Default gpg binary name, resolved through `PATH`
pub const DEFAULT_GPG_BINARY: &str = "gpg";

/// Kustomization file names, in lookup order.
/// Exactly one of them may exist in an overlay directory.
pub const KUSTOMIZATION_FILE_NAMES: [&str; 3] =
    ["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// Secret data key of docker registry credentials, always JSON
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Top-level key holding SOPS metadata in structured documents
pub const SOPS_METADATA_KEY: &str = "sops";

/// Prefix of SOPS metadata keys in dotenv documents
pub const SOPS_DOTENV_PREFIX: &str = "sops_";

/// Default `unencrypted_suffix` when a document sets no field selector
pub const DEFAULT_UNENCRYPTED_SUFFIX: &str = "_unencrypted";

/// Version written into metadata of documents encrypted by this crate
pub const SOPS_METADATA_VERSION: &str = "3.9.0";

/// Marker replacing a captured MAC value in integrity errors
pub const REDACTED_MARKER: &str = "<redacted>";

/// Placeholder for an absent MAC in integrity errors
pub const NO_MAC: &str = "no MAC";

/// Upper bound on unsealed data key size read from an age payload
pub const MAX_UNSEALED_KEY_SIZE: usize = 1024;

/// Maximum symlinks followed while resolving a single path
pub const MAX_SYMLINK_FOLLOWS: usize = 255;

/// GCP Cloud KMS REST endpoint
pub const GCP_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";

/// GCP OAuth scope for Cloud KMS
pub const GCP_KMS_SCOPE: &str = "https://www.googleapis.com/auth/cloudkms";

/// Default GCP OAuth token endpoint
pub const GCP_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// GCP metadata server token endpoint (workload identity)
pub const GCP_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Azure Key Vault token scope
pub const AZURE_VAULT_SCOPE: &str = "https://vault.azure.net/.default";

/// Default Azure authority host
pub const AZURE_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Azure instance metadata token endpoint (managed identity)
pub const AZURE_IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Azure Key Vault API version used for unwrapkey
pub const AZURE_KEY_VAULT_API_VERSION: &str = "7.4";

/// Key holding the payload of a binary document
pub const BINARY_DATA_KEY: &str = "data";
