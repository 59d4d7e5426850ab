//! # Kustomize Decryptor CLI
//!
//! Runs the decryption engine against a checked-out build root, the way the
//! controller does during a reconciliation.
//!
//! ## Usage
//!
//! ```bash
//! # Decrypt every secretGenerator source reachable from an overlay
//! kustomize-decryptor decrypt-tree --root /tmp/build --path clusters/prod \
//!     --namespace flux-system --secret sops-keys
//!
//! # Decrypt one file in place with a local age key
//! kustomize-decryptor decrypt-file /tmp/build/secrets.enc.yaml --age-key-file key.txt
//!
//! # Decrypt the Secrets in rendered manifests
//! kustomize build clusters/prod | kustomize-decryptor decrypt-manifests --age-key-file key.txt
//! ```

#![recursion_limit = "256"]

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use kube::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kustomize_decryptor::config::DecryptorConfig;
use kustomize_decryptor::crd::{Decryption, Kustomization, KustomizationSpec};
use kustomize_decryptor::decryptor::{
    paths, Decryptor, Format, SecretSource, StaticSecretSource,
};
use kustomize_decryptor::observability::metrics;

/// Secure SOPS decryption for kustomize overlays
#[derive(Parser)]
#[command(name = "kustomize-decryptor")]
#[command(
    about = "Secure SOPS decryption for kustomize overlays",
    long_about = None,
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("BUILD_GIT_HASH"),
        ", built ",
        env!("BUILD_DATETIME"),
        ")"
    ),
    after_help = "\
Decryption keys come from a Kubernetes Secret (--secret) and/or local age key
files (--age-key-file). Ambient cloud credentials are used for AWS KMS, GCP KMS
and Azure Key Vault keys the Secret does not configure.

Examples:
  kustomize-decryptor decrypt-tree --root /tmp/build --path ./apps --secret sops-keys
  kustomize-decryptor decrypt-file /tmp/build/app.enc.env \\
    --input-format dotenv --output-format dotenv
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long, global = true)]
    print_metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk an overlay and decrypt its secretGenerator sources in place
    DecryptTree {
        /// Build root; nothing outside of it is read or written
        #[arg(long, value_name = "DIR")]
        root: PathBuf,

        /// Overlay path, relative to the root
        #[arg(long, value_name = "PATH", default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        keys: KeyArgs,
    },
    /// Decrypt a single file in place
    DecryptFile {
        /// File to decrypt
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Build root, defaults to the file's directory
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,

        /// Store format of the encrypted file, detected when omitted
        #[arg(long, value_name = "FORMAT", requires = "output_format")]
        input_format: Option<Format>,

        /// Store format to write, derived from the file name when omitted
        #[arg(long, value_name = "FORMAT", requires = "input_format")]
        output_format: Option<Format>,

        #[command(flatten)]
        keys: KeyArgs,
    },
    /// Decrypt encrypted resources in multi-document YAML, as rendered by `kustomize build`
    DecryptManifests {
        /// Manifest file, stdin when omitted
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,

        #[command(flatten)]
        keys: KeyArgs,
    },
}

#[derive(Args)]
struct KeyArgs {
    /// Namespace of the decryption Secret
    #[arg(short, long, default_value = "flux-system")]
    namespace: String,

    /// Name of the Secret holding decryption keys
    #[arg(long, value_name = "NAME")]
    secret: Option<String>,

    /// File with age identities, may be repeated
    #[arg(long, value_name = "FILE")]
    age_key_file: Vec<PathBuf>,
}

impl KeyArgs {
    /// The Kustomization a controller would hand to the decryptor
    fn kustomization(&self) -> Kustomization {
        let mut kustomization = Kustomization::new(
            "cli",
            KustomizationSpec {
                path: None,
                decryption: Some(Decryption::sops(self.secret.as_deref())),
            },
        );
        kustomization.metadata.namespace = Some(self.namespace.clone());
        kustomization
    }

    async fn decryptor(
        &self,
        root: &Path,
        config: DecryptorConfig,
        cancel: CancellationToken,
    ) -> Result<Decryptor> {
        let root = absolute_path(root)?;
        let mut decryptor =
            Decryptor::new(root, &self.kustomization(), config)?.with_cancellation(cancel);

        if self.secret.is_some() {
            let client = Client::try_default()
                .await
                .context("Failed to create Kubernetes client")?;
            decryptor.import_keys(&client as &dyn SecretSource).await?;
        } else {
            decryptor.import_keys(&StaticSecretSource::new()).await?;
        }

        for path in &self.age_key_file {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read age key file '{}'", path.display()))?;
            let count = decryptor
                .credentials_mut()
                .add_age_identities(&text)
                .map_err(|e| anyhow!("Invalid age key file '{}': {e}", path.display()))?;
            info!(file = %path.display(), identities = count, "loaded age identities");
        }

        decryptor.set_auth_options();
        Ok(decryptor)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Configure rustls crypto provider before any TLS connections
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = DecryptorConfig::from_env();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    format!("kustomize_decryptor={}", config.log_level.to_lowercase()).into()
                }),
        )
        .init();

    if config.enable_metrics {
        metrics::register_metrics()?;
    }

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling decryption");
            signal_cancel.cancel();
        }
    });

    let result = match cli.command {
        Commands::DecryptTree { root, path, keys } => {
            decrypt_tree(&root, &path, &keys, config, cancel).await
        }
        Commands::DecryptFile {
            file,
            root,
            input_format,
            output_format,
            keys,
        } => {
            decrypt_file(
                &file,
                root.as_deref(),
                input_format,
                output_format,
                &keys,
                config,
                cancel,
            )
            .await
        }
        Commands::DecryptManifests { file, keys } => {
            decrypt_manifests(file.as_deref(), &keys, config, cancel).await
        }
    };

    if cli.print_metrics {
        eprint!("{}", metrics::gather_text()?);
    }
    result
}

async fn decrypt_tree(
    root: &Path,
    path: &Path,
    keys: &KeyArgs,
    config: DecryptorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let decryptor = keys.decryptor(root, config, cancel).await?;
    decryptor.decrypt_sources(path).await?;
    info!(
        root = %decryptor.root().display(),
        path = %path.display(),
        "Decrypted kustomization sources"
    );
    Ok(())
}

async fn decrypt_file(
    file: &Path,
    root: Option<&Path>,
    input_format: Option<Format>,
    output_format: Option<Format>,
    keys: &KeyArgs,
    config: DecryptorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let file = absolute_path(file)?;
    let root = file_root(&file, root)?;
    let decryptor = keys.decryptor(&root, config, cancel).await?;

    let decrypted = match (input_format, output_format) {
        (Some(input), Some(output)) => decryptor.decrypt_file(&file, input, output).await?,
        _ => decryptor.decrypt_file_detected(&file).await?,
    };

    if decrypted {
        info!(file = %file.display(), "Decrypted file");
    } else {
        info!(file = %file.display(), "File is not encrypted, left untouched");
    }
    Ok(())
}

/// Absolute form of a CLI path with `.` and `..` removed
fn absolute_path(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)
        .with_context(|| format!("Failed to resolve '{}'", path.display()))?;
    Ok(paths::clean(&absolute))
}

/// Build root of a single file: the explicit root, else the file's directory
fn file_root(file: &Path, root: Option<&Path>) -> Result<PathBuf> {
    match root {
        Some(root) => absolute_path(root),
        None => file
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("'{}' has no parent directory", file.display())),
    }
}

async fn decrypt_manifests(
    file: Option<&Path>,
    keys: &KeyArgs,
    config: DecryptorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let input = match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read '{}'", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read manifests from stdin")?;
            buf
        }
    };

    // Resources are decrypted in memory; the root only has to be valid
    let root = std::env::current_dir().context("Failed to get current directory")?;
    let decryptor = keys.decryptor(&root, config, cancel).await?;

    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&input) {
        let resource =
            serde_json::Value::deserialize(document).context("Failed to parse manifest")?;
        if resource.is_null() {
            continue;
        }
        let resource = decryptor.decrypt_resource(&resource).await?.unwrap_or(resource);
        documents.push(serde_yaml::to_string(&resource).context("Failed to serialize manifest")?);
    }

    print!("{}", documents.join("---\n"));
    Ok(())
}
