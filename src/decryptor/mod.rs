//! # Decryptor
//!
//! SOPS decryption for kustomize overlays, scoped to one reconciliation
//! attempt of one `Kustomization`.
//!
//! ## Flow
//!
//! 1. [`Decryptor::import_keys`] reads the Secret named by
//!    `spec.decryption.secretRef` into a fresh [`CredentialStore`]
//! 2. [`Decryptor::set_auth_options`] adds ambient cloud credentials for
//!    backends the Secret did not configure
//! 3. [`Decryptor::decrypt_sources`] walks the overlay graph from the build
//!    path and decrypts every `secretGenerator` env and file source in place
//! 4. after `kustomize build`, [`Decryptor::decrypt_resource`] decrypts the
//!    rendered Secrets that are still encrypted
//!
//! Every filesystem access stays under the build root. Nothing is cached
//! across attempts: build a new `Decryptor` for every reconciliation.
//!
//! ```rust,no_run
//! use std::path::Path;
//! use kustomize_decryptor::config::DecryptorConfig;
//! use kustomize_decryptor::crd::Kustomization;
//! use kustomize_decryptor::decryptor::Decryptor;
//!
//! # async fn example(client: kube::Client, ks: Kustomization) -> anyhow::Result<()> {
//! let mut decryptor = Decryptor::new("/tmp/build", &ks, DecryptorConfig::from_env())?;
//! decryptor.import_keys(&client).await?;
//! decryptor.set_auth_options();
//! decryptor.decrypt_sources(Path::new("clusters/prod")).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod file;
pub mod format;
pub mod keys;
pub mod kustomize;
pub mod paths;
pub mod resource;
pub mod sops;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

pub use self::error::{
    Backend, DecryptError, FileError, KeyImportError, PathError, SopsError, UnsealError, WalkError,
};
pub use self::file::FileDecryptor;
pub use self::format::Format;
pub use self::keys::{CredentialStore, SecretSource, StaticSecretSource, UnsealContext};
pub use self::kustomize::{GraphWalker, Overlay, OverlayVisitor, VisitedSet};
pub use self::resource::ResourceDecryptor;
pub use self::sops::CryptoPipeline;

use crate::config::DecryptorConfig;
use crate::crd::{Decryption, Kustomization};

/// Decryption context of one reconciliation attempt
#[derive(Debug)]
pub struct Decryptor {
    root: PathBuf,
    namespace: String,
    /// SOPS decryption settings; `None` disables every operation
    decryption: Option<Decryption>,
    config: DecryptorConfig,
    credentials: CredentialStore,
    ctx: UnsealContext,
}

impl Decryptor {
    /// Decryptor for `kustomization` confined to the build root `root`.
    ///
    /// A Kustomization without decryption settings, or naming a provider
    /// other than `sops`, yields a decryptor whose operations are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`DecryptError::Path`] when `root` is not an absolute,
    /// normalized path.
    pub fn new(
        root: impl Into<PathBuf>,
        kustomization: &Kustomization,
        config: DecryptorConfig,
    ) -> Result<Self, DecryptError> {
        let root = root.into();
        paths::validate_root(&root)?;
        Ok(Self {
            root,
            namespace: kustomization.namespace_or_default().to_string(),
            decryption: kustomization.sops_decryption().cloned(),
            ctx: UnsealContext::new(&config),
            config,
            credentials: CredentialStore::default(),
        })
    }

    /// Abort unsealing and key import when `cancel` fires
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.ctx = self.ctx.with_cancellation(cancel);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the Kustomization asks for SOPS decryption
    pub fn is_enabled(&self) -> bool {
        self.decryption.is_some()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Mutable access for keys that do not come from a Secret (CLI key files)
    pub fn credentials_mut(&mut self) -> &mut CredentialStore {
        &mut self.credentials
    }

    fn pipeline(&self) -> CryptoPipeline<'_> {
        CryptoPipeline::new(&self.credentials, &self.ctx)
    }

    fn file_decryptor(&self) -> FileDecryptor<'_> {
        FileDecryptor::new(&self.root, self.config.max_file_size, self.pipeline())
    }

    /// Import keys from the Secret referenced by the Kustomization.
    ///
    /// Without decryption settings or a Secret reference this does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DecryptError::Import`] when the Secret is missing, cannot be
    /// fetched, or holds malformed key material (well-formed entries are
    /// still imported), and [`DecryptError::Cancelled`] when cancelled.
    pub async fn import_keys(&mut self, source: &dyn SecretSource) -> Result<(), DecryptError> {
        let Some(secret_name) = self
            .decryption
            .as_ref()
            .and_then(|d| d.secret_ref.as_ref())
            .map(|r| r.name.clone())
        else {
            return Ok(());
        };
        let namespace = self.namespace.clone();
        let secret = format!("{namespace}/{secret_name}");

        let span = info_span!(
            "decryptor.import_keys",
            secret = %secret,
            operation.success = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            error.message = tracing::field::Empty,
        );
        let span_clone = span.clone();

        async move {
            let start = Instant::now();
            let result: Result<(), DecryptError> = async {
                let fetched = tokio::select! {
                    biased;
                    () = self.ctx.cancel.cancelled() => return Err(DecryptError::Cancelled),
                    fetched = source.get_secret(&namespace, &secret_name) => fetched,
                };
                let data = fetched
                    .map_err(|source| KeyImportError::Source {
                        secret: secret.clone(),
                        source,
                    })?
                    .ok_or_else(|| KeyImportError::SecretNotFound { secret: secret.clone() })?;
                self.credentials.import_secret(&secret, &data)?;
                Ok(())
            }
            .await;

            span_clone.record(
                "duration_ms",
                u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            );
            span_clone.record("operation.success", result.is_ok());
            match &result {
                Ok(()) => info!(
                    secret = %secret,
                    credentials = ?self.credentials,
                    "imported decryption keys"
                ),
                Err(err) => {
                    span_clone.record("error.message", err.to_string());
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Provide ambient credentials for the cloud backends that
    /// [`Decryptor::import_keys`] left unconfigured. Does nothing unless
    /// SOPS decryption is enabled.
    pub fn set_auth_options(&mut self) {
        if self.is_enabled() {
            self.credentials.set_auth_options();
        }
    }

    /// Decrypt a rendered resource.
    ///
    /// Returns `None` when decryption is disabled or nothing in the resource
    /// is encrypted.
    ///
    /// # Errors
    ///
    /// Fails when an encrypted document or Secret data field cannot be
    /// decrypted.
    pub async fn decrypt_resource(
        &self,
        resource: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, DecryptError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        ResourceDecryptor::new(self.pipeline()).decrypt(resource).await
    }

    /// Walk the overlays reachable from `path` and decrypt their
    /// `secretGenerator` sources in place. Each source file is decrypted at
    /// most once, however many overlays refer to it.
    ///
    /// # Errors
    ///
    /// Returns the first traversal or file error; see [`GraphWalker::walk`].
    pub async fn decrypt_sources(&self, path: &Path) -> Result<(), DecryptError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut walker = GraphWalker::new(&self.root)?;
        let mut visitor = SourceDecryptor {
            files: self.file_decryptor(),
            decrypted: HashSet::new(),
        };
        walker.walk(path, &mut visitor).await?;
        debug!(
            overlays = walker.visited().len(),
            sources = visitor.decrypted.len(),
            "decrypted kustomization sources"
        );
        Ok(())
    }

    /// Decrypt a single file under the root in place.
    /// Returns whether the file was encrypted.
    ///
    /// # Errors
    ///
    /// See [`FileDecryptor::decrypt_file`].
    pub async fn decrypt_file(
        &self,
        path: &Path,
        input: Format,
        output: Format,
    ) -> Result<bool, DecryptError> {
        Ok(self.file_decryptor().decrypt_file(path, input, output).await?)
    }

    /// Decrypt a single file under the root in place, detecting its formats
    ///
    /// # Errors
    ///
    /// See [`FileDecryptor::decrypt_detected`].
    pub async fn decrypt_file_detected(&self, path: &Path) -> Result<bool, DecryptError> {
        Ok(self.file_decryptor().decrypt_detected(path).await?)
    }

    /// Decrypt an in-memory document
    ///
    /// # Errors
    ///
    /// See [`CryptoPipeline::decrypt`].
    pub async fn decrypt_data(
        &self,
        data: &[u8],
        input: Format,
        output: Format,
    ) -> Result<Vec<u8>, DecryptError> {
        Ok(self.pipeline().decrypt(data, input, output).await?)
    }
}

#[derive(Debug, Clone, Copy)]
enum SourceKind {
    Env,
    File,
}

/// Decrypts the generator sources of every visited overlay
struct SourceDecryptor<'a> {
    files: FileDecryptor<'a>,
    decrypted: HashSet<PathBuf>,
}

impl SourceDecryptor<'_> {
    /// Decrypt one generator source of the overlay in `dir`.
    ///
    /// The source is resolved under `root` first, so a symlink to a file
    /// inside the root decrypts its target. Absolute sources are accepted when
    /// they lie inside the root.
    async fn decrypt_source(
        &mut self,
        root: &Path,
        dir: &Path,
        source: &str,
        kind: SourceKind,
    ) -> Result<(), FileError> {
        let candidate = if Path::new(source).is_absolute() {
            PathBuf::from(source)
        } else {
            dir.join(source)
        };
        let (path, relative) = paths::resolve(root, &candidate)?;
        if self.decrypted.contains(&path) {
            return Ok(());
        }

        let decrypted = match kind {
            SourceKind::Env => {
                self.files
                    .decrypt_file(&path, Format::Dotenv, Format::Dotenv)
                    .await?
            }
            SourceKind::File => self.files.decrypt_detected(&path).await?,
        };
        debug!(
            source = %source,
            file = %relative.display(),
            decrypted,
            "processed generator source"
        );
        self.decrypted.insert(path);
        Ok(())
    }
}

#[async_trait]
impl OverlayVisitor for SourceDecryptor<'_> {
    async fn visit(&mut self, root: &Path, dir: &Path, overlay: &Overlay) -> Result<(), FileError> {
        for generator in &overlay.secret_generator {
            for env in generator.env_sources() {
                self.decrypt_source(root, dir, env, SourceKind::Env).await?;
            }
            for spec in &generator.files {
                let source =
                    kustomize::parse_file_source(spec).map_err(|reason| FileError::InvalidSource {
                        spec: spec.clone(),
                        reason,
                    })?;
                self.decrypt_source(root, dir, source, SourceKind::File).await?;
            }
        }
        Ok(())
    }
}
