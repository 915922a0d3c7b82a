//! Atomic report output + digest utilities for jobfit.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfit-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
    /// The destination already held identical bytes; nothing was rewritten.
    pub unchanged: bool,
}

/// Writes report files under a root directory. Bare file names resolve inside
/// the root; anything with a directory component or an absolute path is used
/// as given.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        let is_bare_name = !path.is_absolute()
            && path.components().count() == 1
            && matches!(path.components().next(), Some(Component::Normal(_)));
        if is_bare_name {
            self.root.join(path)
        } else {
            path.to_path_buf()
        }
    }

    /// Replace `path` with `bytes` via a temp file in the same directory and a
    /// rename, so readers never observe a partial report.
    pub async fn write_atomic(
        &self,
        path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<WrittenFile> {
        let path = self.resolve(path);
        let sha256 = sha256_hex(bytes);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating output directory {}", parent.display()))?;
        }

        if let Ok(existing) = fs::read(&path).await {
            if sha256_hex(&existing) == sha256 {
                debug!(path = %path.display(), "output unchanged; skipping rewrite");
                return Ok(WrittenFile {
                    path,
                    sha256,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.join(temp_name),
            None => PathBuf::from(temp_name),
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp output file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp output file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp output file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp output {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(WrittenFile {
            path,
            sha256,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }

    /// Serialize as JSON (2-space indent when `pretty`) and write atomically.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
        pretty: bool,
    ) -> anyhow::Result<WrittenFile> {
        let path = path.as_ref();
        let bytes = if pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
        .with_context(|| format!("serializing {}", path.display()))?;
        self.write_atomic(path, &bytes).await
    }

    /// Remove an output left behind by an earlier run. Returns whether a file
    /// was actually removed.
    pub async fn remove_stale(&self, path: impl AsRef<Path>) -> anyhow::Result<bool> {
        let path = self.resolve(path);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "removed stale output from a previous run");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}
