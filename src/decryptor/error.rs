//! # Decryptor Errors
//!
//! Typed errors for every stage of decryption.
//!
//! Confinement violations, malformed credentials, unparseable documents,
//! integrity failures and oversized files are all fatal for a decryption
//! attempt. Only the walker distinguishes an "ignorable" kind (missing or
//! non-directory branches) that callers may skip.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use super::format::Format;

/// Path confinement errors
#[derive(Debug, Error)]
pub enum PathError {
    /// The build root itself is unusable
    #[error("build root '{root}' is invalid: {reason}")]
    InvalidRoot { root: PathBuf, reason: String },

    /// The path lexically resolves outside of the build root
    #[error("path '{path}' resolves outside of build root '{root}'")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    /// A symlink on the way points outside of the build root
    #[error("path '{path}' is a symlink to '{target}' outside of build root '{root}'")]
    SymlinkOutsideRoot {
        path: PathBuf,
        target: PathBuf,
        root: PathBuf,
    },

    /// Too many symlinks were followed while resolving the path
    #[error("too many levels of symbolic links resolving '{path}'")]
    TooManyLinks { path: PathBuf },

    #[error("failed to resolve '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Encrypted document codec errors
#[derive(Debug, Error)]
pub enum SopsError {
    /// The document could not be parsed in its store format
    #[error("failed to load encrypted {format} data: {reason}")]
    Load { format: Format, reason: String },

    /// The plaintext could not be parsed in its store format
    #[error("failed to load {format} plaintext: {reason}")]
    LoadPlain { format: Format, reason: String },

    /// The document has no SOPS metadata block
    #[error("sops metadata not found")]
    MetadataNotFound,

    /// The plaintext already carries SOPS metadata
    #[error("document is already encrypted")]
    AlreadyEncrypted,

    #[error("invalid sops metadata: {0}")]
    Metadata(String),

    /// No configured backend could unseal any key group
    #[error("cannot get sops data key: {}", .0.join("; "))]
    DataKey(Vec<String>),

    /// The MAC did not verify; the message is already redacted
    #[error("failed to verify sops data integrity: {0}")]
    Integrity(String),

    /// A single value failed to decrypt or encrypt
    #[error("failed to process value at '{path}': {reason}")]
    Value { path: String, reason: String },

    /// The tree could not be serialized as the output format
    #[error("failed to emit {format} data: {reason}")]
    Emit { format: Format, reason: String },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(Format),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A master key could not seal the data key
    #[error("failed to seal data key: {0}")]
    Seal(String),

    /// The decryption context was cancelled while unsealing
    #[error("decryption cancelled")]
    Cancelled,
}

/// Backend kinds that can hold decryption material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Pgp,
    Age,
    HcVault,
    AwsKms,
    GcpKms,
    AzureKeyVault,
}

impl Backend {
    /// Short label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Pgp => "pgp",
            Backend::Age => "age",
            Backend::HcVault => "hc_vault",
            Backend::AwsKms => "aws_kms",
            Backend::GcpKms => "gcp_kms",
            Backend::AzureKeyVault => "azure_kv",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Pgp => "PGP",
            Backend::Age => "age",
            Backend::HcVault => "HashiCorp Vault",
            Backend::AwsKms => "AWS KMS",
            Backend::GcpKms => "GCP KMS",
            Backend::AzureKeyVault => "Azure Key Vault",
        };
        f.write_str(name)
    }
}

/// Errors unsealing a data key with one master key
#[derive(Debug, Error)]
pub enum UnsealError {
    /// No credentials for this backend were imported
    #[error("no {0} credentials configured")]
    NotConfigured(Backend),

    #[error("{backend}: {reason}")]
    Failed { backend: Backend, reason: String },

    #[error("{backend} unseal timed out after {secs}s")]
    Timeout { backend: Backend, secs: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

impl UnsealError {
    pub(crate) fn failed(backend: Backend, reason: impl fmt::Display) -> Self {
        UnsealError::Failed {
            backend,
            reason: reason.to_string(),
        }
    }
}

/// Credential import errors
#[derive(Debug, Error)]
pub enum KeyImportError {
    /// The referenced Secret does not exist
    #[error("cannot get decryption Secret '{secret}': not found")]
    SecretNotFound { secret: String },

    /// The Secret could not be fetched
    #[error("cannot get decryption Secret '{secret}': {source}")]
    Source {
        secret: String,
        #[source]
        source: anyhow::Error,
    },

    /// A Secret key held malformed material for its backend
    #[error("failed to import '{key}' {backend} data from Secret '{secret}': {reason}")]
    Invalid {
        backend: Backend,
        key: String,
        secret: String,
        reason: String,
    },

    /// More than one key failed; every failure is listed
    #[error("{}", join_errors(.0))]
    Multiple(Vec<KeyImportError>),
}

fn join_errors(errors: &[KeyImportError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Single file decryption errors
#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Path(#[from] PathError),

    /// The path is a symlink, device, socket or other non-regular file
    #[error("cannot decrypt irregular file as it has file mode type bits set: '{path}'")]
    Irregular { path: PathBuf },

    /// The file exceeds the configured size limit
    #[error("cannot decrypt file with size ({size} bytes) exceeding limit ({limit})")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    /// A generator file source is not `[key=]path`
    #[error("invalid generator file source '{spec}': {reason}")]
    InvalidSource { spec: String, reason: String },

    #[error("failed to decrypt '{path}': {source}")]
    Sops {
        path: PathBuf,
        #[source]
        source: SopsError,
    },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileError {
    /// Whether the file does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FileError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// Overlay graph traversal errors
#[derive(Debug, Error)]
pub enum WalkError {
    /// The path does not exist (ignorable)
    #[error("lstat {path}: no such file or directory")]
    NotFound { path: PathBuf },

    /// The path is not a directory or kustomization file (ignorable)
    #[error("{path}: not a directory")]
    NotDirectory { path: PathBuf },

    #[error("found multiple kustomization files in '{dir}'")]
    Ambiguous { dir: PathBuf },

    #[error("no kustomization file found in '{dir}'")]
    NoKustomization { dir: PathBuf },

    #[error("failed to unmarshal kustomization file '{path}': {reason}")]
    Unmarshal { path: PathBuf, reason: String },

    #[error(transparent)]
    Path(#[from] PathError),

    /// The visitor failed for an overlay
    #[error("failed to process overlay '{dir}': {source}")]
    Visit {
        dir: PathBuf,
        #[source]
        source: FileError,
    },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WalkError {
    /// Whether traversal may skip this branch and continue with its siblings
    pub fn is_ignorable(&self) -> bool {
        matches!(self, WalkError::NotFound { .. } | WalkError::NotDirectory { .. })
    }
}

/// Errors returned by the [`Decryptor`](super::Decryptor) facade
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error(transparent)]
    Import(#[from] KeyImportError),

    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Sops(#[from] SopsError),

    /// A resource could not be decoded or re-encoded
    #[error("failed to decrypt {resource}: {reason}")]
    Resource { resource: String, reason: String },

    /// The codec failed on a resource or one of its data fields
    #[error("failed to decrypt {resource}: {source}")]
    ResourceSops {
        resource: String,
        #[source]
        source: SopsError,
    },

    /// The attempt was cancelled before it completed
    #[error("decryption cancelled")]
    Cancelled,

    #[error("failed to initialize decryptor: {0}")]
    Init(String),
}

impl DecryptError {
    /// Whether a retry of the same attempt could succeed without changes.
    ///
    /// Only network-backed unsealing may be transient; cancellation is
    /// final for the attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            DecryptError::Sops(SopsError::DataKey(reasons))
            | DecryptError::ResourceSops {
                source: SopsError::DataKey(reasons),
                ..
            }
            | DecryptError::File(FileError::Sops {
                source: SopsError::DataKey(reasons),
                ..
            }) => reasons.iter().any(|r| r.contains("timed out")),
            DecryptError::Import(KeyImportError::Source { .. }) => true,
            _ => false,
        }
    }
}
