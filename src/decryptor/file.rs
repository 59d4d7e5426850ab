//! # File Decryption
//!
//! Decrypts a single file under the build root in place.
//!
//! The file must be a regular file: the final path component is inspected
//! with `lstat`, so a symlink is rejected rather than followed, while
//! symlinked parent directories are resolved and confined to the root. The
//! size limit is checked before the content is read, and the file is only
//! rewritten once the whole document decrypted in memory.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tracing::{debug, info_span, Instrument};

use super::error::{FileError, PathError};
use super::format::{formats_for_encrypted, Format};
use super::paths;
use super::sops::CryptoPipeline;
use crate::observability::metrics;

/// Decrypts files under one build root
#[derive(Debug, Clone, Copy)]
pub struct FileDecryptor<'a> {
    root: &'a Path,
    max_file_size: u64,
    pipeline: CryptoPipeline<'a>,
}

impl<'a> FileDecryptor<'a> {
    pub fn new(root: &'a Path, max_file_size: u64, pipeline: CryptoPipeline<'a>) -> Self {
        Self {
            root,
            max_file_size,
            pipeline,
        }
    }

    /// Decrypt `path` in place from `input` to `output` format.
    ///
    /// Returns `false` without touching the file when it does not carry the
    /// marker of `input`, i.e. is not encrypted in that format.
    ///
    /// # Errors
    ///
    /// Returns [`FileError`] when the path escapes the root, is not a
    /// regular file, exceeds the size limit, or fails to decrypt.
    pub async fn decrypt_file(
        &self,
        path: &Path,
        input: Format,
        output: Format,
    ) -> Result<bool, FileError> {
        self.instrumented(path, |abs_path, data| async move {
            if !input.has_marker(&data) {
                return Ok(None);
            }
            self.decrypt_data(&abs_path, &data, input, output).await.map(Some)
        })
        .await
    }

    /// Decrypt `path` in place, detecting the input format from the
    /// content and the output format from the file name.
    ///
    /// # Errors
    ///
    /// Same as [`FileDecryptor::decrypt_file`].
    pub async fn decrypt_detected(&self, path: &Path) -> Result<bool, FileError> {
        self.instrumented(path, |abs_path, data| async move {
            let name = abs_path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let (input, output) = formats_for_encrypted(name, &data);
            if input == Format::Unsupported {
                return Ok(None);
            }
            self.decrypt_data(&abs_path, &data, input, output).await.map(Some)
        })
        .await
    }

    async fn decrypt_data(
        &self,
        path: &Path,
        data: &[u8],
        input: Format,
        output: Format,
    ) -> Result<Vec<u8>, FileError> {
        debug!(path = %path.display(), input = %input, output = %output, "decrypting file");
        self.pipeline
            .decrypt(data, input, output)
            .await
            .map_err(|source| FileError::Sops {
                path: paths::strip_root(self.root, path),
                source,
            })
    }

    /// Read `path`, hand its content to `decrypt`, and write back the
    /// plaintext it returns.
    async fn instrumented<F, Fut>(&self, path: &Path, decrypt: F) -> Result<bool, FileError>
    where
        F: FnOnce(PathBuf, Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = Result<Option<Vec<u8>>, FileError>>,
    {
        let span = info_span!(
            "sops.decrypt_file",
            file.path = %path.display(),
            operation.success = tracing::field::Empty,
            decrypted = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            error.message = tracing::field::Empty,
        );
        let span_clone = span.clone();

        async move {
            let start = Instant::now();
            let result: Result<bool, FileError> = async {
                let abs_path = self.resolve_regular_file(path)?;
                let data = self.read_bounded(&abs_path).await?;
                match decrypt(abs_path.clone(), data).await? {
                    Some(plaintext) => {
                        tokio::fs::write(&abs_path, plaintext)
                            .await
                            .map_err(|source| FileError::Io {
                                path: abs_path.clone(),
                                source,
                            })?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            .await;

            span_clone.record(
                "duration_ms",
                u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            );
            span_clone.record("operation.success", result.is_ok());
            match &result {
                Ok(true) => {
                    span_clone.record("decrypted", true);
                    metrics::increment_files_decrypted();
                }
                Ok(false) => {
                    span_clone.record("decrypted", false);
                    metrics::increment_files_skipped();
                }
                Err(err) => {
                    span_clone.record("error.message", err.to_string());
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Confine `path` to the root and require a regular file.
    ///
    /// Parent directories may be symlinks inside the root; the file itself
    /// must not be one.
    fn resolve_regular_file(&self, path: &Path) -> Result<PathBuf, FileError> {
        let lexical = paths::secure_abs_path(self.root, path)?;
        let file_name = lexical.file_name().ok_or_else(|| PathError::OutsideRoot {
            path: path.to_path_buf(),
            root: self.root.to_path_buf(),
        })?;
        let parent = lexical.parent().unwrap_or(self.root);
        let (parent, _) = paths::resolve(self.root, parent)?;
        let abs_path = parent.join(file_name);

        let metadata = std::fs::symlink_metadata(&abs_path).map_err(|source| FileError::Io {
            path: abs_path.clone(),
            source,
        })?;
        if !metadata.file_type().is_file() {
            return Err(FileError::Irregular {
                path: paths::strip_root(self.root, &abs_path),
            });
        }
        if metadata.len() > self.max_file_size {
            return Err(FileError::TooLarge {
                path: abs_path,
                size: metadata.len(),
                limit: self.max_file_size,
            });
        }
        Ok(abs_path)
    }

    /// Read at most the size limit, in case the file grew after `lstat`
    async fn read_bounded(&self, path: &Path) -> Result<Vec<u8>, FileError> {
        let io_err = |source| FileError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(io_err)?;
        let mut data = Vec::new();
        file.take(self.max_file_size.saturating_add(1))
            .read_to_end(&mut data)
            .await
            .map_err(io_err)?;
        let size = u64::try_from(data.len()).unwrap_or(u64::MAX);
        if size > self.max_file_size {
            return Err(FileError::TooLarge {
                path: path.to_path_buf(),
                size,
                limit: self.max_file_size,
            });
        }
        Ok(data)
    }
}
