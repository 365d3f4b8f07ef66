//! Filesystem seam: an `async_trait` abstraction over the
//! handful of `tokio::fs` calls a monitor needs, so rotation/truncation
//! logic can be exercised in tests without touching a real disk.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileStat {
    pub inode: u64,
    pub size: u64,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Reads bytes `[from, from + max_len)` (or to EOF, whichever is
    /// shorter) from `path`.
    async fn read_range(&self, path: &Path, from: u64, max_len: usize) -> Result<Vec<u8>>;

    async fn exists(&self, path: &Path) -> bool;
}

/// Real filesystem, backed by `tokio::fs`.
pub struct RealFs;

#[async_trait]
impl FileSystem for RealFs {
    async fn stat(&self, path: &Path) -> Result<FileStat> {
        use std::os::unix::fs::MetadataExt;
        let meta = tokio::fs::metadata(path).await?;
        Ok(FileStat {
            inode: meta.ino(),
            size: meta.len(),
        })
    }

    async fn read_range(&self, path: &Path, from: u64, max_len: usize) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(from)).await?;
        let mut buf = vec![0u8; max_len];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }
}

/// In-memory double for unit tests: simulates rotation/truncation by
/// letting the test mutate `(inode, contents)` directly between reads.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, (u64, Vec<u8>)>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, path: &Path, inode: u64, contents: Vec<u8>) {
        self.files
            .lock()
            .await
            .insert(path.to_path_buf(), (inode, contents));
    }

    pub async fn append(&self, path: &Path, more: &[u8]) {
        let mut files = self.files.lock().await;
        if let Some((_, contents)) = files.get_mut(path) {
            contents.extend_from_slice(more);
        }
    }
}

#[async_trait]
impl FileSystem for MemFs {
    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let files = self.files.lock().await;
        let (inode, contents) = files
            .get(path)
            .ok_or_else(|| crate::error::IngestError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file")))?;
        Ok(FileStat {
            inode: *inode,
            size: contents.len() as u64,
        })
    }

    async fn read_range(&self, path: &Path, from: u64, max_len: usize) -> Result<Vec<u8>> {
        let files = self.files.lock().await;
        let (_, contents) = files
            .get(path)
            .ok_or_else(|| crate::error::IngestError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file")))?;
        let from = from as usize;
        if from >= contents.len() {
            return Ok(Vec::new());
        }
        let end = (from + max_len).min(contents.len());
        Ok(contents[from..end].to_vec())
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files.lock().await.contains_key(path)
    }
}
