//! Storage backends for the target file
//!
//! The piece store writes verified pieces through a [`StorageBackend`] at
//! explicit byte offsets. Backends are driven by a single writer, so they do
//! not need interior locking for ordering.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;

/// Suffix appended to the final name while the download is in progress
pub const PARTIAL_SUFFIX: &str = ".part";

/// Destination for verified piece data
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write `data` starting at byte `offset` of the target
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Truncate the target to `size` bytes and publish it under its final
    /// name
    async fn finalize(&mut self, size: u64) -> Result<()>;

    /// Human-readable location, used in logs
    fn location(&self) -> String;
}

/// Disk backend writing to `<name>.part` and renaming on completion
#[derive(Debug)]
pub struct FileBackend {
    partial_path: PathBuf,
    final_path: PathBuf,
    file: Option<fs::File>,
}

impl FileBackend {
    /// Create (or truncate) the temporary file for `name` inside `dir`
    pub async fn create(dir: &Path, name: &str) -> Result<Self> {
        let final_path = dir.join(name);
        let partial_path = dir.join(format!("{}{}", name, PARTIAL_SUFFIX));
        info!("Creating temporary file: {}", partial_path.display());

        if !dir.as_os_str().is_empty() && !dir.exists() {
            debug!("Creating output directory: {}", dir.display());
            fs::create_dir_all(dir).await.map_err(|e| {
                error!("Failed to create output directory '{}': {}", dir.display(), e);
                TorrentError::storage_error_full("Failed to create output directory", dir.display().to_string(), e.to_string())
            })?;
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial_path)
            .await
            .map_err(|e| {
                error!("Failed to create file '{}': {}", partial_path.display(), e);
                TorrentError::storage_error_full("Failed to create file", partial_path.display().to_string(), e.to_string())
            })?;

        Ok(Self {
            partial_path,
            final_path,
            file: Some(file),
        })
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    fn handle(&mut self) -> Result<&mut fs::File> {
        let path = self.partial_path.display().to_string();
        self.file
            .as_mut()
            .ok_or_else(|| TorrentError::storage_error_with_path("File already finalized", path).into())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        trace!("Writing {} bytes at offset {}", data.len(), offset);
        let path = self.partial_path.display().to_string();
        let file = self.handle()?;

        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|e| {
            error!("Failed to seek in file '{}': {}", path, e);
            TorrentError::storage_error_full("Failed to seek in file", path.clone(), e.to_string())
        })?;
        file.write_all(data).await.map_err(|e| {
            error!("Failed to write to file '{}': {}", path, e);
            TorrentError::storage_error_full("Failed to write to file", path.clone(), e.to_string())
        })?;
        Ok(())
    }

    async fn finalize(&mut self, size: u64) -> Result<()> {
        let path = self.partial_path.display().to_string();
        let mut file = self
            .file
            .take()
            .ok_or_else(|| TorrentError::storage_error_with_path("File already finalized", path.clone()))?;

        file.flush().await.map_err(|e| {
            error!("Failed to flush file '{}': {}", path, e);
            TorrentError::storage_error_full("Failed to flush file", path.clone(), e.to_string())
        })?;
        file.set_len(size).await.map_err(|e| {
            error!("Failed to truncate file '{}': {}", path, e);
            TorrentError::storage_error_full("Failed to truncate file", path.clone(), e.to_string())
        })?;
        file.sync_all().await.map_err(|e| {
            error!("Failed to sync file '{}': {}", path, e);
            TorrentError::storage_error_full("Failed to sync file", path.clone(), e.to_string())
        })?;
        drop(file);

        fs::rename(&self.partial_path, &self.final_path).await.map_err(|e| {
            error!("Failed to rename '{}' to '{}': {}", path, self.final_path.display(), e);
            TorrentError::storage_error_full("Failed to rename file", self.final_path.display().to_string(), e.to_string())
        })?;

        info!("Finalized {} ({} bytes)", self.final_path.display(), size);
        Ok(())
    }

    fn location(&self) -> String {
        self.final_path.display().to_string()
    }
}

/// In-memory backend, mainly for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    buffer: Arc<Mutex<Vec<u8>>>,
    finalized: Arc<Mutex<bool>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current content
    pub async fn contents(&self) -> Vec<u8> {
        self.buffer.lock().await.clone()
    }

    pub async fn is_finalized(&self) -> bool {
        *self.finalized.lock().await
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        let mut buffer = self.buffer.lock().await;
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn finalize(&mut self, size: u64) -> Result<()> {
        let mut finalized = self.finalized.lock().await;
        if *finalized {
            return Err(TorrentError::storage_error_with_path("File already finalized", "memory").into());
        }
        self.buffer.lock().await.resize(size as usize, 0);
        *finalized = true;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
