//! # Overlay Graph Walk
//!
//! Discovers every kustomization reachable from a starting overlay through
//! `resources` and `components`, and hands each one to an [`OverlayVisitor`]
//! exactly once.
//!
//! Every reference is resolved under the build root with symlinks followed,
//! so a link pointing outside of the root aborts the walk. Directories are
//! recorded by their resolved absolute path in a [`VisitedSet`], which makes
//! diamonds and cycles terminate. Remote references (URLs, git repositories)
//! are skipped; they are never decrypted locally.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info_span, trace, Instrument};

use super::error::{FileError, WalkError};
use super::paths;
use crate::constants::KUSTOMIZATION_FILE_NAMES;
use crate::observability::metrics;

static URL_SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://")
        .expect("URL scheme pattern is a valid regex - this should never happen")
});

static SCP_LIKE_GIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w.\-]+@[\w.\-]+:")
        .expect("scp-like git pattern is a valid regex - this should never happen")
});

static HOST_PATH_WITH_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w\-]+(\.[\w\-]+)+(:\d+)?/[^?]*\?([^&]*&)*(ref|version)=[^&]+")
        .expect("git host pattern is a valid regex - this should never happen")
});

/// The parts of a kustomization file the walk and source decryption need
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub secret_generator: Vec<SecretGenerator>,
}

/// A `secretGenerator` entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SecretGenerator {
    #[serde(default)]
    pub name: String,
    /// Env files, `KEY=value` per line
    #[serde(default)]
    pub envs: Vec<String>,
    /// Deprecated single env file
    #[serde(default)]
    pub env: Option<String>,
    /// File sources, `[key=]path`
    #[serde(default)]
    pub files: Vec<String>,
}

impl SecretGenerator {
    /// Every env file path, including the deprecated `env`
    pub fn env_sources(&self) -> impl Iterator<Item = &str> {
        self.envs.iter().map(String::as_str).chain(self.env.as_deref())
    }
}

/// Path of a `[key=]path` file source
///
/// # Errors
///
/// Fails when the key or the path is empty, or when either contains `=`.
pub fn parse_file_source(source: &str) -> Result<&str, String> {
    let mut parts = source.split('=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(path), None, _) if !path.is_empty() => Ok(path),
        (Some(""), Some(_), None) => Err("key name for file path is missing".to_string()),
        (Some(_), Some(""), None) => Err("file path is missing".to_string()),
        (Some(_), Some(path), None) => Ok(path),
        (Some(""), None, _) => Err("file source is empty".to_string()),
        _ => Err("key names or file paths cannot contain '='".to_string()),
    }
}

impl Overlay {
    /// Parse a kustomization file. An empty file is an empty overlay.
    ///
    /// # Errors
    ///
    /// Returns [`WalkError::Unmarshal`] when the file is not a kustomization.
    pub fn parse(path: &Path, content: &str) -> Result<Self, WalkError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| WalkError::Unmarshal {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Resource and component references, in file order
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().chain(&self.components).map(String::as_str)
    }
}

/// Whether a resource reference points outside the local filesystem:
/// a URL, an scp-like git address, or a git host path with a `ref`/`version`.
pub fn is_remote(reference: &str) -> bool {
    URL_SCHEME.is_match(reference)
        || SCP_LIKE_GIT.is_match(reference)
        || HOST_PATH_WITH_REF.is_match(reference)
}

/// Overlay directories already visited during one walk, by resolved absolute path
#[derive(Debug, Clone, Default)]
pub struct VisitedSet(HashSet<PathBuf>);

impl VisitedSet {
    pub fn contains(&self, dir: &Path) -> bool {
        self.0.contains(dir)
    }

    /// Record `dir`; `false` when it was already present
    pub fn insert(&mut self, dir: PathBuf) -> bool {
        self.0.insert(dir)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Called once per discovered overlay
#[async_trait]
pub trait OverlayVisitor: Send {
    /// `dir` is the absolute, resolved overlay directory under `root`
    async fn visit(&mut self, root: &Path, dir: &Path, overlay: &Overlay) -> Result<(), FileError>;
}

/// Depth-first walker over the overlay graph under one build root
#[derive(Debug)]
pub struct GraphWalker {
    root: PathBuf,
    visited: VisitedSet,
}

impl GraphWalker {
    /// # Errors
    ///
    /// Returns [`WalkError::Path`] when `root` is not an absolute, normalized path.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WalkError> {
        let root = root.into();
        paths::validate_root(&root)?;
        Ok(Self {
            root,
            visited: VisitedSet::default(),
        })
    }

    pub fn visited(&self) -> &VisitedSet {
        &self.visited
    }

    /// Walk from `start`, a directory or kustomization file under the root.
    ///
    /// Ignorable errors are only swallowed for referenced branches; for
    /// `start` itself they are returned so the caller can decide.
    ///
    /// # Errors
    ///
    /// Returns the first non-ignorable [`WalkError`], including any error
    /// from the visitor.
    pub async fn walk(
        &mut self,
        start: &Path,
        visitor: &mut dyn OverlayVisitor,
    ) -> Result<(), WalkError> {
        let span = info_span!(
            "kustomize.walk",
            walk.start = %start.display(),
            overlays = tracing::field::Empty,
            operation.success = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            error.message = tracing::field::Empty,
        );
        let span_clone = span.clone();

        async move {
            let start_time = Instant::now();
            let before = self.visited.len();
            let result = self.recurse(start.to_path_buf(), visitor).await;

            span_clone.record("overlays", self.visited.len() - before);
            span_clone.record(
                "duration_ms",
                u64::try_from(start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
            );
            span_clone.record("operation.success", result.is_ok());
            if let Err(err) = &result {
                span_clone.record("error.message", err.to_string());
            }
            result
        }
        .instrument(span)
        .await
    }

    fn recurse<'a>(
        &'a mut self,
        path: PathBuf,
        visitor: &'a mut dyn OverlayVisitor,
    ) -> BoxFuture<'a, Result<(), WalkError>> {
        async move {
            let (dir, file) = self.locate(&path)?;
            if self.visited.contains(&dir) {
                trace!(dir = %dir.display(), "overlay already visited");
                return Ok(());
            }
            let file = match file {
                Some(file) => file,
                None => self.find_kustomization(&dir)?,
            };

            let content = tokio::fs::read_to_string(&file).await.map_err(|source| WalkError::Io {
                path: file.clone(),
                source,
            })?;
            let overlay = Overlay::parse(&file, &content)?;
            self.visited.insert(dir.clone());
            metrics::increment_overlays_visited();
            debug!(
                dir = %dir.display(),
                references = overlay.resources.len() + overlay.components.len(),
                "visiting overlay"
            );

            visitor
                .visit(&self.root, &dir, &overlay)
                .await
                .map_err(|source| WalkError::Visit {
                    dir: paths::strip_root(&self.root, &dir),
                    source,
                })?;

            for reference in overlay.references() {
                if is_remote(reference) {
                    debug!(reference = %reference, "skipping remote reference");
                    continue;
                }
                let target = Path::new(reference);
                let target = if target.is_absolute() {
                    target.to_path_buf()
                } else {
                    dir.join(target)
                };
                match self.recurse(target, &mut *visitor).await {
                    Err(err) if err.is_ignorable() => {
                        trace!(reference = %reference, error = %err, "skipping reference");
                    }
                    result => result?,
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Resolve `path` to its overlay directory, plus the kustomization file
    /// when `path` named one directly.
    fn locate(&self, path: &Path) -> Result<(PathBuf, Option<PathBuf>), WalkError> {
        let (abs_path, _) = paths::resolve(&self.root, path)?;
        let metadata = match std::fs::metadata(&abs_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(WalkError::NotFound { path: abs_path });
            }
            Err(source) => return Err(WalkError::Io { path: abs_path, source }),
        };
        if metadata.is_dir() {
            return Ok((abs_path, None));
        }

        let is_kustomization = abs_path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| KUSTOMIZATION_FILE_NAMES.contains(&name));
        match abs_path.parent() {
            Some(dir) if metadata.is_file() && is_kustomization => {
                Ok((dir.to_path_buf(), Some(abs_path.clone())))
            }
            _ => Err(WalkError::NotDirectory { path: abs_path }),
        }
    }

    /// The single kustomization file in `dir`
    fn find_kustomization(&self, dir: &Path) -> Result<PathBuf, WalkError> {
        let mut found = None;
        for name in KUSTOMIZATION_FILE_NAMES {
            let candidate = dir.join(name);
            match std::fs::symlink_metadata(&candidate) {
                Ok(_) if found.is_some() => {
                    return Err(WalkError::Ambiguous {
                        dir: paths::strip_root(&self.root, dir),
                    });
                }
                Ok(_) => found = Some(candidate),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(WalkError::Io { path: candidate, source }),
            }
        }
        let file = found.ok_or_else(|| WalkError::NoKustomization {
            dir: paths::strip_root(&self.root, dir),
        })?;
        let (file, _) = paths::resolve(&self.root, &file)?;
        Ok(file)
    }
}
