use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use chunkline_protocol::{DEFAULT_CHUNK_SIZE, total_chunks_for};

use crate::error::{UploadError, UploadResult};
use crate::validation::validate_relative_path;

/// One numbered slice of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based chunk ordinal.
    pub number: u32,
    /// Byte offset within the file.
    pub offset: u64,
    pub data: Vec<u8>,
    /// SHA-256 hex digest of `data`.
    pub checksum: String,
}

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Returns `true` if `data` hashes to `expected` (case-insensitive hex).
pub fn verify_checksum(data: &[u8], expected: &str) -> bool {
    checksum_bytes(data).eq_ignore_ascii_case(expected.trim())
}

/// Returns `true` if `s` looks like a SHA-256 hex digest.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> UploadResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a file in fixed-size, numbered chunks with SHA-256 checksums.
pub struct ChunkReader {
    file: std::fs::File,
    chunk_size: u64,
    next_number: u32,
    file_name: String,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(path: &Path, chunk_size: u64) -> UploadResult<Self> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            file,
            chunk_size,
            next_number: 1,
            file_name,
            file_size,
        })
    }

    /// Positions the reader so the next call yields chunk `number`.
    pub fn seek_to_chunk(&mut self, number: u32) -> UploadResult<()> {
        if number == 0 || number > self.total_chunks() {
            return Err(UploadError::InvalidChunk(format!(
                "chunk {number} outside 1..={}",
                self.total_chunks()
            )));
        }
        self.file
            .seek(SeekFrom::Start(self.offset_of(number)))?;
        self.next_number = number;
        Ok(())
    }

    /// Reads chunk `number` directly.
    pub fn read_chunk(&mut self, number: u32) -> UploadResult<Chunk> {
        self.seek_to_chunk(number)?;
        self.next_chunk()?
            .ok_or_else(|| UploadError::InvalidChunk(format!("chunk {number} is empty")))
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub fn next_chunk(&mut self) -> UploadResult<Option<Chunk>> {
        let offset = self.offset_of(self.next_number);
        let remaining = self.file_size.saturating_sub(offset);
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size) as usize;
        let mut buf = vec![0u8; read_size];
        self.file.read_exact(&mut buf)?;

        let chunk = Chunk {
            number: self.next_number,
            offset,
            checksum: checksum_bytes(&buf),
            data: buf,
        };
        self.next_number += 1;
        Ok(Some(chunk))
    }

    fn offset_of(&self, number: u32) -> u64 {
        u64::from(number.saturating_sub(1)) * self.chunk_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        total_chunks_for(self.file_size, self.chunk_size)
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Final path component of the file being read.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Writes chunk bytes at exact offsets into files under a base directory.
pub struct ChunkWriter {
    base_path: PathBuf,
    written: HashMap<String, u64>,
}

impl ChunkWriter {
    /// Creates a writer rooted at `base_path`.
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            written: HashMap::new(),
        }
    }

    /// Creates `rel_path` empty, discarding anything a previous run left there.
    pub fn create(&mut self, rel_path: &str) -> UploadResult<()> {
        validate_relative_path(rel_path)?;
        let full_path = self.base_path.join(rel_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&full_path)?;
        self.written.insert(rel_path.to_string(), 0);
        Ok(())
    }

    /// Writes `chunk` into `rel_path` at the chunk's offset.
    ///
    /// - Rejects paths that escape the base directory.
    /// - Verifies the checksum if non-empty.
    /// - Creates intermediate directories as needed.
    pub fn write_chunk(&mut self, rel_path: &str, chunk: &Chunk) -> UploadResult<()> {
        validate_relative_path(rel_path)?;

        if !chunk.checksum.is_empty() && !verify_checksum(&chunk.data, &chunk.checksum) {
            return Err(UploadError::ChecksumMismatch {
                chunk: chunk.number,
            });
        }

        let full_path = self.base_path.join(rel_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&full_path)?;
        file.seek(SeekFrom::Start(chunk.offset))?;
        file.write_all(&chunk.data)?;

        let end = chunk.offset + chunk.data.len() as u64;
        let entry = self.written.entry(rel_path.to_string()).or_insert(0);
        *entry = (*entry).max(end);
        Ok(())
    }

    /// Highest byte offset written to `rel_path` (0 if never written).
    pub fn written_offset(&self, rel_path: &str) -> u64 {
        self.written.get(rel_path).copied().unwrap_or(0)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
