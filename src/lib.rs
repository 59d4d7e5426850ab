//! # Kustomize Decryptor
//!
//! Secure traversal and SOPS decryption for kustomize overlays reconciled by
//! a GitOps controller.
//!
//! Before `kustomize build` runs, the overlay graph is walked from the build
//! path and the env and file sources of every `secretGenerator` are decrypted
//! in place. After the build, rendered resources that are still encrypted are
//! decrypted before they are applied. All filesystem access is confined to the
//! build root, symlinks included.
//!
//! See [`decryptor::Decryptor`] for the entry point.

#![recursion_limit = "256"]

pub mod config;
pub mod constants;
pub mod crd;
pub mod decryptor;
pub mod observability;

pub use config::DecryptorConfig;
pub use crd::{Decryption, Kustomization, KustomizationSpec};
pub use decryptor::{DecryptError, Decryptor, Format};
