//! # Decryptor Integration Tests
//!
//! End-to-end runs of the decryptor against overlay trees on disk:
//! - key import from a decryption Secret
//! - in-place decryption of secretGenerator sources across overlays
//! - confinement of every source to the build root
//! - decryption of rendered resources

#![recursion_limit = "256"]

mod common;

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use common::{init_rustls, sops_kustomization, AgeKeypair, BuildRoot, NAMESPACE, SECRET_NAME};
use kustomize_decryptor::config::DecryptorConfig;
use kustomize_decryptor::crd::{Kustomization, KustomizationSpec};
use kustomize_decryptor::decryptor::keys::StaticSecretSource;
use kustomize_decryptor::decryptor::{
    DecryptError, Decryptor, FileError, Format, KeyImportError, PathError, SopsError, WalkError,
};

async fn decryptor(root: &BuildRoot, keys: &AgeKeypair) -> Decryptor {
    init_rustls();
    let mut decryptor =
        Decryptor::new(root.as_path(), &sops_kustomization(), DecryptorConfig::default())
            .expect("valid build root");
    decryptor
        .import_keys(&keys.secret_source())
        .await
        .expect("keys import");
    decryptor.set_auth_options();
    decryptor
}

/// base with generator sources, prod overlay pulling in base
fn layout(root: &BuildRoot, keys: &AgeKeypair) {
    root.write(
        "base/kustomization.yaml",
        r"
resources:
  - deployment.yaml
secretGenerator:
  - name: app
    envs:
      - app.env
    files:
      - config.yaml
      - token=token.json
",
    );
    root.write("base/deployment.yaml", "kind: Deployment\n");
    root.write("base/app.env", keys.encrypt(b"PASSWORD=hunter2\n", Format::Dotenv));
    root.write("base/config.yaml", keys.encrypt(b"user: admin\n", Format::Yaml));
    root.write("base/token.json", keys.encrypt(br#"{"token": "s3cr3t"}"#, Format::Json));

    root.write(
        "overlays/prod/kustomization.yaml",
        r"
resources:
  - ../../base
  - https://github.com/example/remote//deploy?ref=v1
secretGenerator:
  - name: prod
    env: prod.env
    files:
      - ../../base/config.yaml
",
    );
    root.write("overlays/prod/prod.env", keys.encrypt(b"REPLICAS=3\n", Format::Dotenv));
}

#[tokio::test]
async fn test_decrypts_generator_sources_across_overlays() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    layout(&root, &keys);

    let decryptor = decryptor(&root, &keys).await;
    decryptor.decrypt_sources(Path::new("overlays/prod")).await.unwrap();

    assert_eq!(root.read("base/app.env"), "PASSWORD=hunter2\n");
    assert_eq!(root.read("base/config.yaml"), "user: admin\n");
    assert_eq!(root.read("overlays/prod/prod.env"), "REPLICAS=3\n");
    let token: serde_json::Value = serde_json::from_str(&root.read("base/token.json")).unwrap();
    assert_eq!(token, serde_json::json!({"token": "s3cr3t"}));
    assert_eq!(root.read("base/deployment.yaml"), "kind: Deployment\n");
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    layout(&root, &keys);

    let decryptor = decryptor(&root, &keys).await;
    decryptor.decrypt_sources(Path::new("overlays/prod")).await.unwrap();
    decryptor.decrypt_sources(Path::new("overlays/prod")).await.unwrap();
    assert_eq!(root.read("base/app.env"), "PASSWORD=hunter2\n");
}

#[tokio::test]
async fn test_source_outside_root_is_rejected() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    root.write(
        "app/kustomization.yaml",
        r"
secretGenerator:
  - name: escape
    files:
      - ../../../../etc/passwd
",
    );

    let decryptor = decryptor(&root, &keys).await;
    let err = decryptor.decrypt_sources(Path::new("app")).await.unwrap_err();
    assert!(
        matches!(
            err,
            DecryptError::Walk(WalkError::Visit {
                source: FileError::Path(PathError::OutsideRoot { .. }),
                ..
            })
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_absolute_source_inside_root_is_decrypted() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    let source = root.write("shared/app.env", keys.encrypt(b"KEY=value\n", Format::Dotenv));
    root.write(
        "app/kustomization.yaml",
        format!(
            "secretGenerator:\n  - name: absolute\n    envs:\n      - {}\n",
            source.display()
        ),
    );

    let decryptor = decryptor(&root, &keys).await;
    decryptor.decrypt_sources(Path::new("app")).await.unwrap();
    assert_eq!(root.read("shared/app.env"), "KEY=value\n");
}

#[tokio::test]
async fn test_absolute_source_outside_root_is_rejected() {
    let root = BuildRoot::new();
    let outside = BuildRoot::new();
    let keys = AgeKeypair::generate();
    let target = outside.write("app.env", keys.encrypt(b"KEY=value\n", Format::Dotenv));
    root.write(
        "app/kustomization.yaml",
        format!(
            "secretGenerator:\n  - name: absolute\n    envs:\n      - {}\n",
            target.display()
        ),
    );

    let decryptor = decryptor(&root, &keys).await;
    let err = decryptor.decrypt_sources(Path::new("app")).await.unwrap_err();
    assert!(
        matches!(
            err,
            DecryptError::Walk(WalkError::Visit {
                source: FileError::Path(PathError::OutsideRoot { .. }),
                ..
            })
        ),
        "unexpected error: {err}"
    );
    assert!(std::fs::read_to_string(&target).unwrap().contains("sops_mac=ENC["));
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlinked_source_inside_root_is_decrypted() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    root.write("otherdir/data.env", keys.encrypt(b"KEY=value\n", Format::Dotenv));
    root.write(
        "subdir/kustomization.yaml",
        r"
secretGenerator:
  - name: linked
    envs:
      - symlink
",
    );
    std::os::unix::fs::symlink("../otherdir/data.env", root.join("subdir/symlink")).unwrap();

    let decryptor = decryptor(&root, &keys).await;
    decryptor.decrypt_sources(Path::new("subdir")).await.unwrap();
    assert_eq!(root.read("otherdir/data.env"), "KEY=value\n");
    assert!(std::fs::symlink_metadata(root.join("subdir/symlink"))
        .unwrap()
        .file_type()
        .is_symlink());
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlinked_source_outside_root_is_rejected() {
    let root = BuildRoot::new();
    let outside = BuildRoot::new();
    let keys = AgeKeypair::generate();
    let target = outside.write("secret.env", keys.encrypt(b"KEY=value\n", Format::Dotenv));
    root.write(
        "app/kustomization.yaml",
        r"
secretGenerator:
  - name: linked
    envs:
      - linked.env
",
    );
    std::os::unix::fs::symlink(&target, root.join("app/linked.env")).unwrap();

    let decryptor = decryptor(&root, &keys).await;
    let err = decryptor.decrypt_sources(Path::new("app")).await.unwrap_err();
    assert!(
        matches!(
            err,
            DecryptError::Walk(WalkError::Visit {
                source: FileError::Path(PathError::SymlinkOutsideRoot { .. }),
                ..
            })
        ),
        "unexpected error: {err}"
    );
    // The target outside of the root is never touched
    assert!(std::fs::read_to_string(&target).unwrap().contains("sops_mac=ENC["));
}

#[tokio::test]
async fn test_missing_source_is_an_error() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    root.write(
        "app/kustomization.yaml",
        r"
secretGenerator:
  - name: partial
    envs:
      - missing.env
",
    );

    let decryptor = decryptor(&root, &keys).await;
    let err = decryptor.decrypt_sources(Path::new("app")).await.unwrap_err();
    let DecryptError::Walk(WalkError::Visit { source, .. }) = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(source.is_not_found(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_wrong_key_leaves_source_encrypted() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    let other = AgeKeypair::generate();
    root.write(
        "app/kustomization.yaml",
        r"
secretGenerator:
  - name: foreign
    envs:
      - app.env
",
    );
    let encrypted = other.encrypt(b"KEY=value\n", Format::Dotenv);
    root.write("app/app.env", &encrypted);

    let decryptor = decryptor(&root, &keys).await;
    let err = decryptor.decrypt_sources(Path::new("app")).await.unwrap_err();
    assert!(
        matches!(
            err,
            DecryptError::Walk(WalkError::Visit {
                source: FileError::Sops {
                    source: SopsError::DataKey(_),
                    ..
                },
                ..
            })
        ),
        "unexpected error: {err}"
    );
    assert_eq!(std::fs::read(root.join("app/app.env")).unwrap(), encrypted);
}

#[tokio::test]
async fn test_decryption_disabled_leaves_tree_alone() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    layout(&root, &keys);
    let kustomization = Kustomization::new(
        "plain",
        KustomizationSpec {
            path: Some("./overlays/prod".to_string()),
            decryption: None,
        },
    );

    let decryptor =
        Decryptor::new(root.as_path(), &kustomization, DecryptorConfig::default()).unwrap();
    decryptor.decrypt_sources(Path::new("overlays/prod")).await.unwrap();
    assert!(root.read("base/app.env").contains("sops_mac=ENC["));
}

#[tokio::test]
async fn test_partial_import_keeps_valid_keys() {
    init_rustls();
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    root.write("secret.yaml", keys.encrypt(b"key: value\n", Format::Yaml));

    let data = BTreeMap::from([
        ("bad.agekey".to_string(), b"AGE-SECRET-KEY-1NOTAKEY".to_vec()),
        ("good.agekey".to_string(), keys.identity.as_bytes().to_vec()),
    ]);
    let source = StaticSecretSource::new().with_secret(NAMESPACE, SECRET_NAME, data);
    let mut decryptor =
        Decryptor::new(root.as_path(), &sops_kustomization(), DecryptorConfig::default())
            .unwrap();

    let err = decryptor.import_keys(&source).await.unwrap_err();
    assert!(matches!(err, DecryptError::Import(KeyImportError::Invalid { .. })));
    assert!(err.to_string().contains("'bad.agekey'"));

    assert!(decryptor.decrypt_file_detected(Path::new("secret.yaml")).await.unwrap());
    assert_eq!(root.read("secret.yaml"), "key: value\n");
}

#[tokio::test]
async fn test_oversized_source_is_rejected() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    root.write("big.yaml", keys.encrypt(b"key: value\n", Format::Yaml));

    init_rustls();
    let mut decryptor = Decryptor::new(
        root.as_path(),
        &sops_kustomization(),
        DecryptorConfig::default().with_max_file_size(16),
    )
    .unwrap();
    decryptor.import_keys(&keys.secret_source()).await.unwrap();

    let err = decryptor.decrypt_file_detected(Path::new("big.yaml")).await.unwrap_err();
    assert!(matches!(err, DecryptError::File(FileError::TooLarge { limit: 16, .. })));
}

#[tokio::test]
async fn test_decrypts_rendered_secret() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    let engine = base64::engine::general_purpose::STANDARD;
    let secret = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": "app", "namespace": "apps"},
        "type": "Opaque",
        "data": {
            "app.env": engine.encode(keys.encrypt(b"PASSWORD=hunter2\n", Format::Dotenv)),
            "plain": engine.encode(b"visible"),
        },
    });

    let decryptor = decryptor(&root, &keys).await;
    let decrypted = decryptor.decrypt_resource(&secret).await.unwrap().unwrap();
    assert_eq!(decrypted["data"]["app.env"], engine.encode(b"PASSWORD=hunter2\n"));
    assert_eq!(decrypted["data"]["plain"], engine.encode(b"visible"));
    assert_eq!(decrypted["type"], "Opaque");

    let config_map = serde_json::json!({"kind": "ConfigMap", "metadata": {"name": "cm"}});
    assert!(decryptor.decrypt_resource(&config_map).await.unwrap().is_none());
}

#[tokio::test]
async fn test_in_memory_format_conversion() {
    let root = BuildRoot::new();
    let keys = AgeKeypair::generate();
    let encrypted = keys.encrypt(b"KEY=value\n", Format::Dotenv);

    let decryptor = decryptor(&root, &keys).await;
    let yaml = decryptor.decrypt_data(&encrypted, Format::Dotenv, Format::Yaml).await.unwrap();
    assert_eq!(String::from_utf8(yaml).unwrap(), "KEY: value\n");
}
