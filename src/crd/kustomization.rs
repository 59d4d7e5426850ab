//! # Kustomization
//!
//! The subset of the Flux `Kustomization` resource the decryptor reads:
//! where the overlay lives and how its secrets are decrypted.

use serde::{Deserialize, Serialize};

use crate::constants::DECRYPTION_PROVIDER_SOPS;

/// Kustomization Custom Resource
///
/// # Example
///
/// ```yaml
/// apiVersion: kustomize.toolkit.fluxcd.io/v1
/// kind: Kustomization
/// metadata:
///   name: apps
///   namespace: flux-system
/// spec:
///   path: ./clusters/prod
///   decryption:
///     provider: sops
///     secretRef:
///       name: sops-keys
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Kustomization",
    group = "kustomize.toolkit.fluxcd.io",
    version = "v1",
    namespaced,
    shortname = "ks"
)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    /// Path to the overlay directory, relative to the build root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Decryption settings; absent means no decryption is performed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption: Option<Decryption>,
}

/// Decryption settings of a Kustomization
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Decryption {
    /// Decryption provider, only `sops` is acted upon
    pub provider: String,
    /// Secret in the Kustomization's namespace holding decryption keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

/// Reference to a Secret in the same namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct SecretReference {
    pub name: String,
}

impl Decryption {
    /// SOPS decryption with keys from the named Secret
    pub fn sops(secret_name: Option<&str>) -> Self {
        Self {
            provider: DECRYPTION_PROVIDER_SOPS.to_string(),
            secret_ref: secret_name.map(|name| SecretReference {
                name: name.to_string(),
            }),
        }
    }

    /// Whether this decryption block names the SOPS provider
    pub fn is_sops(&self) -> bool {
        self.provider == DECRYPTION_PROVIDER_SOPS
    }
}

impl Kustomization {
    /// Decryption settings, but only when the provider is SOPS
    pub fn sops_decryption(&self) -> Option<&Decryption> {
        self.spec.decryption.as_ref().filter(|d| d.is_sops())
    }

    /// Namespace of the Kustomization, `default` when unset
    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }
}
