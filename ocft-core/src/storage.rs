//! File access seam. The engine never touches the filesystem directly; the host supplies a
//! `FileStore` for range reads (sender) and write-once creation (receiver).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub trait FileStore: Send {
    /// Size of the file in bytes.
    fn size(&self, path: &Path) -> io::Result<u64>;

    /// Read up to `len` bytes starting at `offset`. Short reads only happen at end of file.
    fn read_range(&self, path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    fn exists(&self, path: &Path) -> bool;

    /// Create `path` and write `bytes` to it. Fails if the file already exists.
    fn write_new(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

/// `FileStore` backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileStore;

impl FileStore for LocalFileStore {
    fn size(&self, path: &Path) -> io::Result<u64> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(meta.len())
    }

    fn read_range(&self, path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn write_new(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    }
}

/// In-memory `FileStore`. Clones share the same backing map, so a test can keep a handle
/// after giving one to an engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileStore {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file.
    pub fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.lock().insert(path.into(), bytes);
    }

    /// Contents of a stored file, if present.
    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Vec<u8>>> {
        // A poisoned map still holds consistent bytes; keep serving it.
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn not_found(path: &Path) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found", path.display()),
        )
    }
}

impl FileStore for MemoryFileStore {
    fn size(&self, path: &Path) -> io::Result<u64> {
        self.lock()
            .get(path)
            .map(|b| b.len() as u64)
            .ok_or_else(|| Self::not_found(path))
    }

    fn read_range(&self, path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let files = self.lock();
        let bytes = files.get(path).ok_or_else(|| Self::not_found(path))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    fn write_new(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut files = self.lock();
        if files.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }
        files.insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }
}
