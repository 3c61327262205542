//! Filesystem plumbing for the disk cache.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{CacheError, CacheResult, Filler};

/// The disk cache's view of the filesystem.
///
/// Entry payloads are written to uniquely named files in a temp directory
/// which is re-created empty at cache construction; the random file path is
/// the entry's permanent content address.
#[derive(Debug)]
pub struct CacheFs {
    root: PathBuf,
    tmp: PathBuf,
}

impl CacheFs {
    /// Prepares the cache directories under `root`.
    pub fn new(root: &Path) -> io::Result<Self> {
        let tmp = root.join("tmp");
        std::fs::create_dir_all(root)?;
        recreate_dir(&tmp)?;
        Ok(Self {
            root: root.to_owned(),
            tmp,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp
    }

    /// Writes one payload to a fresh uniquely named file and returns its
    /// path. The file is flushed and synced before the path is handed out;
    /// on error nothing is left behind.
    pub async fn write_atomic(&self, fill: Filler, token: &CancellationToken) -> CacheResult<PathBuf> {
        if token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        // tempfile retries name collisions internally
        let temp_file = tempfile::Builder::new()
            .prefix("ent.")
            .tempfile_in(&self.tmp)?;
        let mut file = tokio::fs::File::from_std(temp_file.reopen()?);

        fill(&mut file).await?;
        file.flush().await?;
        file.sync_all().await?;

        let (_file, path) = temp_file.keep().map_err(|e| CacheError::from(e.error))?;
        Ok(path)
    }

    /// Opens an entry's backing file for reading.
    pub async fn open_read(&self, path: &Path) -> CacheResult<tokio::fs::File> {
        Ok(tokio::fs::File::open(path).await?)
    }

    /// Unlinks an entry's backing file. Failures are logged, not surfaced;
    /// a leaked file is preferable to failing the release path.
    pub fn delete(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to remove cache file",
                );
            }
        }
    }

    /// Lists the entry files currently present in the temp directory.
    pub fn entry_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.tmp)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}

/// Re-creates `path` as an empty directory.
fn recreate_dir(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(path)
}
