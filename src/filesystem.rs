//! The in-memory namespace backing transfers.
//!
//! The mapping only ever holds complete files: a write session accumulates
//! blocks in a private handle and publishes it with [`Root::save`] once the
//! transfer is over. Creating a file drops any previous entry under the same
//! name right away, so concurrent readers observe either the old content or
//! no file at all, never a half-written one.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};

/// A flat namespace mapping file names to in-memory files.
pub struct Root {
    files: RwLock<HashMap<String, Arc<MemoryFile>>>,
}

impl Root {
    pub fn new() -> Root {
        Root { files: RwLock::new(HashMap::new()) }
    }

    /// Create a fresh in-memory file. Any existing entry under `path` is
    /// removed immediately; the new file stays invisible until saved.
    pub fn create_memory_file(&self, path: &str) -> Arc<MemoryFile> {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);

        Arc::new(MemoryFile { name: path.to_string(), data: RwLock::new(Vec::new()) })
    }

    /// Look up a stored file by name.
    pub fn open(&self, name: &str) -> io::Result<Arc<MemoryFile>> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    /// Publish a file under its name, replacing any previous version.
    pub fn save(&self, file: Arc<MemoryFile>) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file.name().to_string(), file);
    }
}

/// A byte-addressable random-access file living entirely in memory.
pub struct MemoryFile {
    name: String,
    data: RwLock<Vec<u8>>,
}

impl MemoryFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read into `buf` starting at `offset`. The count returned falls short
    /// of `buf.len()` near the end of the file; reading at or past the end
    /// reports `UnexpectedEof`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let off = usize::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        if off >= data.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        let end = data.len().min(off + buf.len());
        buf[..end - off].copy_from_slice(&data[off..end]);
        Ok(end - off)
    }

    /// Write `buf` at `offset`, growing the file when the write crosses the
    /// current end. A gap between the end and `offset` is zero-filled.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let off = usize::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let end = off
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        if end > data.len() {
            if off > data.len() {
                data.resize(off, 0);
            } else {
                data.truncate(off);
            }
            data.extend_from_slice(buf);
        } else {
            data[off..end].copy_from_slice(buf);
        }
        Ok(buf.len())
    }

    /// Flushing a memory-backed file is a no-op.
    pub fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    /// Closing a memory-backed file is a no-op.
    pub fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
