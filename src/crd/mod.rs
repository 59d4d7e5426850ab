//! # Custom Resource Definitions
//!
//! Resource types the decryptor consumes from the cluster.

mod kustomization;

pub use kustomization::{Decryption, Kustomization, KustomizationSpec, SecretReference};
