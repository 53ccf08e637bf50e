//! Typed document and directory operations over the managed data tree.
//!
//! The store encodes and decodes documents for its callers but never
//! interprets their semantics. Writes are atomic at the file level
//! (write-to-temp-then-rename); recursive directory work runs on the
//! blocking thread pool.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::{fs, task};

use crate::{GarconError, GarconResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Typed read/write of YAML/JSON documents plus recursive directory
/// operations.
#[derive(Debug, Default, Clone)]
pub struct FileStore;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileStore {
    /// Creates a new file store.
    pub fn new() -> Self {
        Self
    }

    /// Ensures a directory tree exists. Idempotent.
    pub async fn ensure_dir(&self, path: impl AsRef<Path>) -> GarconResult<()> {
        fs::create_dir_all(path.as_ref()).await?;
        Ok(())
    }

    /// Whether the path exists.
    pub async fn exists(&self, path: impl AsRef<Path>) -> bool {
        fs::try_exists(path.as_ref()).await.unwrap_or(false)
    }

    /// Whether the path exists and is a directory.
    pub async fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        fs::metadata(path.as_ref())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Reads and decodes a YAML document.
    pub async fn read_yaml<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> GarconResult<T> {
        let contents = fs::read_to_string(path.as_ref()).await?;
        let value = serde_yaml::from_str(&contents)?;
        Ok(value)
    }

    /// Encodes and writes a YAML document atomically.
    pub async fn write_yaml<T: Serialize>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
    ) -> GarconResult<()> {
        let contents = serde_yaml::to_string(value)?;
        self.write_atomic(path.as_ref(), contents.into_bytes()).await
    }

    /// Reads and decodes a JSON document.
    pub async fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> GarconResult<T> {
        let contents = fs::read_to_string(path.as_ref()).await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Encodes and writes a JSON document atomically.
    pub async fn write_json<T: Serialize>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
    ) -> GarconResult<()> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_atomic(path.as_ref(), contents.into_bytes()).await
    }

    /// Recursively copies `src` into `dst`, creating `dst` if needed.
    /// Existing files in `dst` are overwritten; files absent from `src` are
    /// left in place.
    pub async fn copy_dir(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
    ) -> GarconResult<()> {
        let src = src.as_ref().to_path_buf();
        let dst = dst.as_ref().to_path_buf();

        if !self.is_dir(&src).await {
            return Err(GarconError::not_found(format!(
                "source directory {} does not exist",
                src.display()
            )));
        }

        task::spawn_blocking(move || copy_dir_blocking(&src, &dst))
            .await
            .map_err(GarconError::custom)??;

        Ok(())
    }

    /// Recursively deletes a directory tree. Missing directories are fine.
    pub async fn remove_dir(&self, path: impl AsRef<Path>) -> GarconResult<()> {
        let path = path.as_ref().to_path_buf();
        if !self.exists(&path).await {
            return Ok(());
        }

        task::spawn_blocking(move || std::fs::remove_dir_all(&path))
            .await
            .map_err(GarconError::custom)??;

        Ok(())
    }

    /// Deletes a single file. Missing files are fine.
    pub async fn remove_file(&self, path: impl AsRef<Path>) -> GarconResult<()> {
        match fs::remove_file(path.as_ref()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the names of direct subdirectories. A missing directory yields
    /// an empty list.
    pub async fn list_dirs(&self, path: impl AsRef<Path>) -> GarconResult<Vec<String>> {
        let mut names = Vec::new();

        let mut entries = match fs::read_dir(path.as_ref()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Lists direct files, optionally filtered by extension (without the
    /// dot). A missing directory yields an empty list.
    pub async fn list_files(
        &self,
        path: impl AsRef<Path>,
        extension: Option<&str>,
    ) -> GarconResult<Vec<PathBuf>> {
        let mut files = Vec::new();

        let mut entries = match fs::read_dir(path.as_ref()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(ext) = extension {
                if path.extension().map_or(true, |e| e != ext) {
                    continue;
                }
            }
            files.push(path);
        }

        files.sort();
        Ok(files)
    }

    /// Sums the byte size of every file under a directory tree. A missing
    /// directory has size zero.
    pub async fn dir_size(&self, path: impl AsRef<Path>) -> GarconResult<u64> {
        let path = path.as_ref().to_path_buf();
        if !self.exists(&path).await {
            return Ok(0);
        }

        let size = task::spawn_blocking(move || dir_size_blocking(&path))
            .await
            .map_err(GarconError::custom)??;

        Ok(size)
    }

    async fn write_atomic(&self, path: &Path, contents: Vec<u8>) -> GarconResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, path).await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn copy_dir_blocking(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let dest = dst.join(entry.file_name());

        if path.is_dir() {
            copy_dir_blocking(&path, &dest)?;
        } else if path.is_file() {
            std::fs::copy(&path, &dest)?;
        }
    }

    Ok(())
}

fn dir_size_blocking(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            total += dir_size_blocking(&entry.path())?;
        } else if metadata.is_file() {
            total += metadata.len();
        }
    }

    Ok(total)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_yaml_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new();
        let path = dir.path().join("doc.yaml");

        let doc = Doc {
            name: "alpha".to_string(),
            count: 3,
        };
        store.write_yaml(&path, &doc).await?;

        let loaded: Doc = store.read_yaml(&path).await?;
        assert_eq!(doc, loaded);
        assert!(!store.exists(path.with_extension("tmp")).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_dir_listing_is_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new();
        let missing = dir.path().join("nope");

        assert!(store.list_dirs(&missing).await?.is_empty());
        assert!(store.list_files(&missing, Some("yaml")).await?.is_empty());
        assert_eq!(store.dir_size(&missing).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_copy_dir_overlays_without_deleting() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new();

        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        tokio::fs::create_dir_all(src.join("nested")).await?;
        tokio::fs::create_dir_all(&dst).await?;
        tokio::fs::write(src.join("a.txt"), b"new").await?;
        tokio::fs::write(src.join("nested/b.txt"), b"b").await?;
        tokio::fs::write(dst.join("a.txt"), b"old").await?;
        tokio::fs::write(dst.join("stale.txt"), b"stale").await?;

        store.copy_dir(&src, &dst).await?;

        assert_eq!(tokio::fs::read(dst.join("a.txt")).await?, b"new");
        assert_eq!(tokio::fs::read(dst.join("nested/b.txt")).await?, b"b");
        // A pure copy leaves files absent from the source in place.
        assert!(store.exists(dst.join("stale.txt")).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_dir_size() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new();

        tokio::fs::create_dir_all(dir.path().join("sub")).await?;
        tokio::fs::write(dir.path().join("a.bin"), vec![0u8; 100]).await?;
        tokio::fs::write(dir.path().join("sub/b.bin"), vec![0u8; 28]).await?;

        assert_eq!(store.dir_size(dir.path()).await?, 128);

        Ok(())
    }
}
