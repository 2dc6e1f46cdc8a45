//! Chunk codec: describe a file, read fixed-size chunks, accumulate and verify on the receiver.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use crate::integrity::{self, FileHasher};
use crate::storage::FileStore;

/// Default chunk size in bytes. Small enough that a Base64'd chunk fits a chat message.
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

/// Fallback MIME type for unknown extensions.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Smallest chunk size a receiver accepts in an offer.
pub const MIN_CHUNK_SIZE: u32 = 512;

/// Most chunks a receiver accepts in an offer.
pub const MAX_TOTAL_CHUNKS: u32 = 1 << 20;

/// Block size used when hashing a whole file.
const HASH_BLOCK: usize = 64 * 1024;

/// Indices spelled out in a missing-chunks error before the rest are counted.
const LISTED_INDICES: usize = 16;

/// Metadata the sender puts in an offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    /// Hex SHA-256 of the whole file.
    pub hash: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

/// One chunk read from a file, with its own digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub data: Vec<u8>,
    pub hash: String,
}

/// ceil(size / chunk_size). A zero chunk size yields zero chunks.
pub fn total_chunks(size: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(u64::from(chunk_size))
}

/// Guess a MIME type from the file extension.
pub fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("md") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// Compute size, MIME type, whole-file hash and chunk count for `path`.
pub fn describe<S: FileStore + ?Sized>(
    store: &S,
    path: &Path,
    chunk_size: u32,
) -> Result<FileInfo, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::InvalidChunkSize);
    }
    let size = store.size(path)?;
    let total = total_chunks(size, chunk_size);
    let total_chunks = u32::try_from(total).map_err(|_| ChunkError::TooManyChunks(total))?;

    let mut hasher = FileHasher::new();
    let mut offset = 0u64;
    while offset < size {
        let block = store.read_range(path, offset, HASH_BLOCK)?;
        if block.is_empty() {
            return Err(ChunkError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while hashing", path.display()),
            )));
        }
        hasher.update(&block);
        offset += block.len() as u64;
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(FileInfo {
        filename,
        size,
        mime_type: guess_mime_type(path).to_string(),
        hash: hasher.finish(),
        chunk_size,
        total_chunks,
    })
}

/// Read chunk `index`: bytes `[index*chunk_size, min(size, (index+1)*chunk_size))` plus digest.
pub fn read_chunk<S: FileStore + ?Sized>(
    store: &S,
    path: &Path,
    index: u32,
    chunk_size: u32,
) -> Result<Chunk, ChunkError> {
    let size = store.size(path)?;
    let total = total_chunks(size, chunk_size);
    if u64::from(index) >= total {
        return Err(ChunkError::IndexOutOfRange { index, total });
    }
    let start = u64::from(index) * u64::from(chunk_size);
    let len = (size - start).min(u64::from(chunk_size)) as usize;
    let data = store.read_range(path, start, len)?;
    if data.len() != len {
        return Err(ChunkError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read for chunk {index} of {}", path.display()),
        )));
    }
    let hash = integrity::hash_bytes(&data);
    Ok(Chunk { index, data, hash })
}

/// Receiver-side accumulator: verified chunk bytes by index, checked against the offered
/// size, chunk size and whole-file hash.
#[derive(Debug, Clone)]
pub struct Assembler {
    expected_hash: String,
    size: u64,
    chunk_size: u32,
    total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl Assembler {
    pub fn new(expected_hash: impl Into<String>, size: u64, chunk_size: u32) -> Self {
        let total_chunks = u32::try_from(total_chunks(size, chunk_size)).unwrap_or(u32::MAX);
        Self {
            expected_hash: expected_hash.into(),
            size,
            chunk_size,
            total_chunks,
            chunks: BTreeMap::new(),
        }
    }

    /// Byte length chunk `index` must have: the chunk size, or the remainder for the last
    /// chunk. `None` outside `[0, total_chunks)`.
    pub fn expected_len(&self, index: u32) -> Option<usize> {
        if index >= self.total_chunks {
            return None;
        }
        let start = u64::from(index) * u64::from(self.chunk_size);
        let len = (self.size - start).min(u64::from(self.chunk_size));
        Some(len as usize)
    }

    /// Store chunk `index` if it has the expected length and `bytes` hash to `declared_hash`.
    /// Returns false (and stores nothing) otherwise. Re-adding an index replaces the previous
    /// bytes.
    pub fn add_chunk(&mut self, index: u32, bytes: Vec<u8>, declared_hash: &str) -> bool {
        if self.expected_len(index) != Some(bytes.len()) {
            return false;
        }
        if !integrity::verify_chunk(&bytes, declared_hash) {
            return false;
        }
        self.chunks.insert(index, bytes);
        true
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.chunks.contains_key(&index)
    }

    pub fn received_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// floor(100 * received / total). An empty transfer is 100% done.
    pub fn progress(&self) -> u8 {
        if self.total_chunks == 0 {
            return 100;
        }
        (u64::from(self.received_count()) * 100 / u64::from(self.total_chunks)) as u8
    }

    /// Indices in `[0, total_chunks)` not yet stored, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    /// Concatenate all chunks in index order and check the whole-file hash.
    /// Nothing is produced unless every chunk is present and the digest matches.
    pub fn assemble(&self) -> Result<Vec<u8>, AssembleError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(AssembleError::MissingChunks(missing));
        }
        let len = self.chunks.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for bytes in self.chunks.values() {
            out.extend_from_slice(bytes);
        }
        let actual = integrity::hash_bytes(&out);
        if !actual.eq_ignore_ascii_case(&self.expected_hash) {
            return Err(AssembleError::HashMismatch {
                expected: self.expected_hash.clone(),
                actual,
            });
        }
        Ok(out)
    }

    /// Assemble and write the result once to `path`.
    pub fn assemble_to<S: FileStore + ?Sized>(
        &self,
        store: &S,
        path: &Path,
    ) -> Result<u64, AssembleError> {
        let bytes = self.assemble()?;
        store.write_new(path, &bytes)?;
        Ok(bytes.len() as u64)
    }
}

/// Error describing or reading a source file.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("chunk index {index} out of range (file has {total} chunks)")]
    IndexOutOfRange { index: u32, total: u64 },
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("file needs {0} chunks, more than the protocol can index")]
    TooManyChunks(u64),
}

/// Error assembling a received file.
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("missing chunks: {}", list_indices(.0))]
    MissingChunks(Vec<u32>),
    #[error("file hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// `[a, b, c]`, or the first few indices followed by a count of the rest.
fn list_indices(indices: &[u32]) -> String {
    if indices.len() <= LISTED_INDICES {
        return format!("{indices:?}");
    }
    let head = format!("{:?}", &indices[..LISTED_INDICES]);
    let head = head.trim_end_matches(']');
    format!("{head}, ... {} more]", indices.len() - LISTED_INDICES)
}
