/// File-system helper exposed to scripts as `fs`.
///
/// `FileHelper` is the extended API (JSON helpers, recursive remove, copy,
/// parent directories created on write). `BaselineFs` is the plain fallback
/// installed when the helper cannot be set up; its extended operations fail
/// with an explicit error.
///
/// All I/O in this module uses `tokio::fs`.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{CapabilityHandle, CapabilityName, CapabilityProvider};
use crate::config::FilesConfig;

#[async_trait]
pub trait FileApi: Send + Sync {
    async fn read_text(&self, path: &str) -> Result<String>;
    async fn write_text(&self, path: &str, contents: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> bool;
    async fn remove(&self, path: &str) -> Result<()>;
    /// Sorted entry names of a directory.
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    async fn append_text(&self, _path: &str, _contents: &str) -> Result<()> {
        Err(unsupported("append_text"))
    }

    async fn ensure_dir(&self, _path: &str) -> Result<()> {
        Err(unsupported("ensure_dir"))
    }

    async fn copy(&self, _from: &str, _to: &str) -> Result<()> {
        Err(unsupported("copy"))
    }

    async fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(unsupported("rename"))
    }

    async fn read_json(&self, _path: &str) -> Result<Value> {
        Err(unsupported("read_json"))
    }

    async fn write_json(&self, _path: &str, _value: &Value) -> Result<()> {
        Err(unsupported("write_json"))
    }

    fn is_baseline(&self) -> bool {
        false
    }
}

fn unsupported(op: &str) -> anyhow::Error {
    anyhow!("fs.{op} is not available with the baseline file API")
}

async fn sorted_entries(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

// ── Extended helper ─────────────────────────────────────

pub struct FileHelper {
    root: PathBuf,
}

impl FileHelper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileApi for FileHelper {
    async fn read_text(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| anyhow!("cannot read {}: {e}", full.display()))
    }

    async fn write_text(&self, path: &str, contents: &str) -> Result<()> {
        let full = self.resolve(path);
        Self::ensure_parent(&full).await?;
        tokio::fs::write(&full, contents).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .unwrap_or(false)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        match tokio::fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&full).await?,
            Ok(_) => tokio::fs::remove_file(&full).await?,
            // Removing something that is already gone is not an error
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        sorted_entries(&self.resolve(path)).await
    }

    async fn append_text(&self, path: &str, contents: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let full = self.resolve(path);
        Self::ensure_parent(&full).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.resolve(path)).await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from);
        let dst = self.resolve(to);
        if tokio::fs::metadata(&src).await?.is_dir() {
            bail!("fs.copy only copies files: {} is a directory", src.display());
        }
        Self::ensure_parent(&dst).await?;
        tokio::fs::copy(&src, &dst).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let dst = self.resolve(to);
        Self::ensure_parent(&dst).await?;
        tokio::fs::rename(self.resolve(from), dst).await?;
        Ok(())
    }

    async fn read_json(&self, path: &str) -> Result<Value> {
        let text = self.read_text(path).await?;
        serde_json::from_str(&text).map_err(|e| anyhow!("invalid JSON in {path}: {e}"))
    }

    async fn write_json(&self, path: &str, value: &Value) -> Result<()> {
        let mut text = serde_json::to_string_pretty(value)?;
        text.push('\n');
        self.write_text(path, &text).await
    }
}

// ── Baseline fallback ───────────────────────────────────

/// Unrooted, no-frills file access.
pub struct BaselineFs;

#[async_trait]
impl FileApi for BaselineFs {
    async fn read_text(&self, path: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_text(&self, path: &str, contents: &str) -> Result<()> {
        Ok(tokio::fs::write(path, contents).await?)
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        Ok(tokio::fs::remove_file(path).await?)
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        sorted_entries(Path::new(path)).await
    }

    fn is_baseline(&self) -> bool {
        true
    }
}

// ── Provider ────────────────────────────────────────────

pub struct FilesProvider {
    config: FilesConfig,
}

impl FilesProvider {
    pub fn new(config: FilesConfig) -> Self {
        Self { config }
    }
}

impl CapabilityProvider for FilesProvider {
    fn name(&self) -> CapabilityName {
        CapabilityName::Files
    }

    fn acquire(&self) -> Result<CapabilityHandle> {
        let root = &self.config.root;
        if !root.is_dir() {
            bail!("file helper root {} is not a directory", root.display());
        }
        let root = root.canonicalize()?;
        Ok(CapabilityHandle::Files(Arc::new(FileHelper::new(root))))
    }

    fn fallback(&self) -> Option<CapabilityHandle> {
        Some(CapabilityHandle::Files(Arc::new(BaselineFs)))
    }
}
