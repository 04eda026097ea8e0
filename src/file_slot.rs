use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

/// Per-resource wrapper over a sparse data file.
///
/// Holds exactly one writer handle and one reader handle. The writer is the
/// only writer for this resource's file; readers elsewhere go through
/// [`FileSlot::read_at`] on the shared reader handle.
#[derive(Debug)]
pub struct FileSlot {
    path: PathBuf,
    writer: Mutex<Option<File>>,
    reader: Mutex<Option<File>>,
}

impl FileSlot {
    /// Open (creating if missing) the data file at `path`, including its
    /// parent directory.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent).await.map_err(|e| {
                CacheError::Io(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CacheError::Io(format!("failed to open {}: {e}", path.display())))?;
        let reader = File::open(&path)
            .map_err(|e| CacheError::Io(format!("failed to open {}: {e}", path.display())))?;

        debug!("Opened cache file {}", path.display());

        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `len` bytes starting at `offset`. The returned buffer may
    /// be short if the file ends before `offset + len`.
    pub async fn read_at(&self, offset: i64, len: usize) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| CacheError::NotFound(format!("{} is closed", self.path.display())))?;

        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| CacheError::Io(format!("seek to {offset} failed: {e}")))?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CacheError::Io(format!("read failed: {e}"))),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Seek to `offset` and write all of `data`.
    ///
    /// On failure the writer handle is reopened and the write retried once;
    /// if that also fails, the file is rebuilt by a whole-file atomic
    /// replace carrying the given bytes. Persistent failure after the
    /// fallback surfaces as `Io`.
    pub async fn write_at(&self, offset: i64, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| CacheError::NotFound(format!("{} is closed", self.path.display())))?;

        if Self::write_once(file, offset, data).is_ok() {
            return Ok(());
        }

        warn!(
            "Write at {} to {} failed, reopening handle",
            offset,
            self.path.display()
        );
        match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(mut reopened) => {
                if Self::write_once(&mut reopened, offset, data).is_ok() {
                    *guard = Some(reopened);
                    return Ok(());
                }
            }
            Err(e) => debug!("Reopen of {} failed: {e}", self.path.display()),
        }

        warn!(
            "Retried write to {} failed, falling back to atomic replace",
            self.path.display()
        );
        self.replace_with(offset, data)?;

        // The old handles point at the unlinked inode after the rename.
        *guard = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .map_err(|e| CacheError::Io(format!("reopen after replace failed: {e}")))?,
        );
        let mut reader = self.reader.lock().await;
        if reader.is_some() {
            *reader = Some(
                File::open(&self.path)
                    .map_err(|e| CacheError::Io(format!("reopen after replace failed: {e}")))?,
            );
        }
        Ok(())
    }

    fn write_once(file: &mut File, offset: i64, data: &[u8]) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)
    }

    /// Last-resort recovery: rewrite the whole file through a temp file in
    /// the same directory, splicing `data` in at `offset`, then rename.
    fn replace_with(&self, offset: i64, data: &[u8]) -> Result<()> {
        let mut contents = std::fs::read(&self.path).unwrap_or_default();
        let end = offset as usize + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[offset as usize..end].copy_from_slice(data);

        let tmp = self.path.with_extension("tmp");
        let mut f = File::create(&tmp)
            .map_err(|e| CacheError::Io(format!("create {} failed: {e}", tmp.display())))?;
        f.write_all(&contents)
            .and_then(|_| f.sync_all())
            .map_err(|e| CacheError::Io(format!("replace write failed: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| CacheError::Io(format!("rename into place failed: {e}")))?;
        Ok(())
    }

    /// Fsync the writer handle.
    pub async fn sync(&self) -> Result<()> {
        let guard = self.writer.lock().await;
        let file = guard
            .as_ref()
            .ok_or_else(|| CacheError::NotFound(format!("{} is closed", self.path.display())))?;
        file.sync_all()
            .map_err(|e| CacheError::Io(format!("fsync of {} failed: {e}", self.path.display())))
    }

    /// Current size of the backing file in bytes.
    pub async fn file_size(&self) -> Result<i64> {
        let meta = tokio_fs::metadata(&self.path)
            .await
            .map_err(|e| CacheError::Io(format!("stat of {} failed: {e}", self.path.display())))?;
        Ok(meta.len() as i64)
    }

    /// Fsync and drop both handles. Further reads and writes fail.
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(file) = writer.take() {
            file.sync_all().map_err(|e| {
                CacheError::Io(format!("fsync of {} failed: {e}", self.path.display()))
            })?;
        }
        self.reader.lock().await.take();
        debug!("Closed cache file {}", self.path.display());
        Ok(())
    }
}
