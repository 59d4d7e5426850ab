//! Common test utilities for decryptor integration tests
//!
//! Provides rustls setup, an age keypair that encrypts fixtures, and helpers
//! to lay out overlay trees under a temporary build root.

#![allow(dead_code, reason = "Not every test binary uses every helper")]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Once;

use age::secrecy::ExposeSecret;
use kustomize_decryptor::crd::{Decryption, Kustomization, KustomizationSpec};
use kustomize_decryptor::decryptor::keys::{AgeKey, MasterKey, StaticSecretSource};
use kustomize_decryptor::decryptor::sops::{encrypt_document, KeyGroup, Metadata};
use kustomize_decryptor::decryptor::Format;

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

pub const NAMESPACE: &str = "flux-system";
pub const SECRET_NAME: &str = "sops-keys";

/// An age keypair
pub struct AgeKeypair {
    pub identity: String,
    pub recipient: String,
}

impl AgeKeypair {
    pub fn generate() -> Self {
        let identity = age::x25519::Identity::generate();
        Self {
            identity: identity.to_string().expose_secret().to_string(),
            recipient: identity.to_public().to_string(),
        }
    }

    pub fn metadata(&self) -> Metadata {
        let key = MasterKey::Age(AgeKey::new(self.recipient.clone()));
        Metadata::new(vec![KeyGroup::new(vec![key])])
    }

    pub fn encrypt(&self, plaintext: &[u8], format: Format) -> Vec<u8> {
        encrypt_document(&self.metadata(), plaintext, format, format)
            .expect("Failed to encrypt fixture")
    }

    /// Secret source serving this identity as `flux-system/sops-keys`
    pub fn secret_source(&self) -> StaticSecretSource {
        let data = BTreeMap::from([(
            "identity.agekey".to_string(),
            self.identity.as_bytes().to_vec(),
        )]);
        StaticSecretSource::new().with_secret(NAMESPACE, SECRET_NAME, data)
    }
}

/// Kustomization with SOPS decryption from `flux-system/sops-keys`
pub fn sops_kustomization() -> Kustomization {
    let mut kustomization = Kustomization::new(
        "apps",
        KustomizationSpec {
            path: Some("./".to_string()),
            decryption: Some(Decryption::sops(Some(SECRET_NAME))),
        },
    );
    kustomization.metadata.namespace = Some(NAMESPACE.to_string());
    kustomization
}

/// Temporary build root with symlinks resolved
pub struct BuildRoot {
    _dir: tempfile::TempDir,
    pub path: PathBuf,
}

impl BuildRoot {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().canonicalize().expect("Failed to canonicalize temp dir");
        Self { _dir: dir, path }
    }

    pub fn write(&self, relative: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create fixture directory");
        }
        std::fs::write(&path, content).expect("Failed to write fixture");
        path
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path.join(relative)).expect("Failed to read fixture")
    }

    pub fn join(&self, relative: &str) -> PathBuf {
        self.path.join(relative)
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }
}
