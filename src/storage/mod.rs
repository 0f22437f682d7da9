//! A flat key/value blob store abstraction, consumed by the identity
//! store (§4.B) and usable for any other single-file persisted state.
//!
//! The core never touches `std::fs` directly; it goes through the
//! `BlobStore` trait so tests can swap in an in-memory backend.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::*;

/// A single opened blob, supporting the operations the original
/// platform's storage glue exposes: open, read, write, seek, close.
pub trait BlobStore {
    fn open(&mut self) -> Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn seek(&mut self, pos: u64) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn len(&mut self) -> Result<u64>;
    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates the blob to zero length and seeks to the start, used
    /// when the identity store needs to rewrite its contents from scratch.
    fn truncate(&mut self) -> Result<()>;
}

/// A `BlobStore` backed by a single file on disk.
pub struct FileBlobStore {
    path: PathBuf,
    file: Option<File>,
}

impl FileBlobStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::simple(ErrorKind::Io))
    }
}

impl BlobStore for FileBlobStore {
    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .wrapped(ErrorKind::Io)?;
        self.file = Some(file);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file_mut()?.read(buf).wrapped(ErrorKind::Io)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.file_mut()?.write(buf).wrapped(ErrorKind::Io)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.file_mut()?
            .seek(SeekFrom::Start(pos))
            .wrapped(ErrorKind::Io)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file_mut()?.metadata().wrapped(ErrorKind::Io)?.len())
    }

    fn truncate(&mut self) -> Result<()> {
        let file = self.file_mut()?;
        file.set_len(0).wrapped(ErrorKind::Io)?;
        file.seek(SeekFrom::Start(0)).wrapped(ErrorKind::Io)?;
        Ok(())
    }
}

/// An in-memory `BlobStore`, used by tests and by embedders with no
/// durable filesystem (e.g. running purely in RAM between restarts).
#[derive(Default)]
pub struct InMemoryBlobStore {
    data: Vec<u8>,
    pos: usize,
    opened: bool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn open(&mut self) -> Result<()> {
        self.opened = true;
        self.pos = 0;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.data.len().saturating_sub(self.pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let end = self.pos + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos as usize;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn truncate(&mut self) -> Result<()> {
        self.data.clear();
        self.pos = 0;
        Ok(())
    }
}

/// Convenience: does a path currently exist and contain at least one byte?
pub fn path_has_content(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
