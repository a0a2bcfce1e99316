//! Random-access large-file store.
//!
//! Every other layer reads container bytes through a [`ByteStore`]. Reads are
//! positional and take `&self`, so a store can be shared behind an `Arc`
//! between the container and the raster blocks whose payloads live in it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;
use parking_lot::Mutex;

use super::endian::Endian;
use crate::util::{Error, Result};

/// Positional reader/writer over one container file.
/// Supports both memory-mapped and plain file I/O modes.
pub struct ByteStore {
    inner: StoreInner,
    path: PathBuf,
    size: AtomicU64,
    writable: bool,
}

enum StoreInner {
    /// Memory-mapped file (read-only stores)
    Mmap(Mmap),
    /// Plain file access; the lock keeps seek+read pairs atomic
    File(Mutex<File>),
}

impl ByteStore {
    /// Open an existing file.
    ///
    /// Writable stores always use plain file I/O; read-only stores are
    /// memory-mapped when `use_mmap` is set and the `mmap` feature is enabled.
    pub fn open(path: impl AsRef<Path>, writable: bool, use_mmap: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::FileNotFound(path.to_path_buf())
                } else {
                    Error::Io(e)
                }
            })?;

        let size = file.metadata()?.len();

        let inner = if !writable && use_mmap && cfg!(feature = "mmap") && size > 0 {
            // Safety: mapped read-only; writers replace the file rather than editing it in place
            let mmap = unsafe { Mmap::map(&file) }?;
            StoreInner::Mmap(mmap)
        } else {
            StoreInner::File(Mutex::new(file))
        };

        tracing::debug!(path = %path.display(), size, writable, mmap = matches!(inner, StoreInner::Mmap(_)), "opened byte store");

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            size: AtomicU64::new(size),
            writable,
        })
    }

    /// Path this store was opened from.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[inline]
    pub fn is_mmap(&self) -> bool {
        matches!(self.inner, StoreInner::Mmap(_))
    }

    fn check_range(&self, pos: u64, len: u64) -> Result<()> {
        match pos.checked_add(len) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(Error::invalid(format!(
                "unexpected end of file: {} bytes at offset {} (file size {})",
                len,
                pos,
                self.size()
            ))),
        }
    }

    /// Read bytes at a specific position.
    pub fn read_at(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(pos, &mut buf)?;
        Ok(buf)
    }

    /// Read bytes into an existing buffer.
    pub fn read_into(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(pos, buf.len() as u64)?;

        match &self.inner {
            StoreInner::Mmap(mmap) => {
                let start = pos as usize;
                buf.copy_from_slice(&mmap[start..start + buf.len()]);
                Ok(())
            }
            StoreInner::File(file) => {
                let mut f = file.lock();
                f.seek(SeekFrom::Start(pos))?;
                f.read_exact(buf)?;
                Ok(())
            }
        }
    }

    /// Write bytes at a specific position, extending the file if needed.
    pub fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        match &self.inner {
            StoreInner::Mmap(_) => Err(Error::ReadOnly),
            StoreInner::File(file) => {
                let mut f = file.lock();
                f.seek(SeekFrom::Start(pos))?;
                f.write_all(data)?;
                self.size.fetch_max(pos + data.len() as u64, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        if let StoreInner::File(file) = &self.inner {
            if self.writable {
                let mut f = file.lock();
                f.flush()?;
                f.sync_data()?;
            }
        }
        Ok(())
    }

    /// Read a u8 value at the given position.
    pub fn read_u8(&self, pos: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_into(pos, &mut buf)?;
        Ok(buf[0])
    }

    /// Read a u64 value in the given byte order.
    pub fn read_u64(&self, pos: u64, endian: Endian) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_into(pos, &mut buf)?;
        Ok(endian.read_u64(&buf))
    }

    /// Read an f64 value in the given byte order.
    pub fn read_f64(&self, pos: u64, endian: Endian) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read_into(pos, &mut buf)?;
        Ok(endian.read_f64(&buf))
    }

    /// Visit `[from, to)` in chunks of at most `chunk` bytes.
    pub fn for_each_chunk(
        &self,
        from: u64,
        to: u64,
        chunk: usize,
        mut f: impl FnMut(&[u8]),
    ) -> Result<()> {
        self.check_range(from, to.saturating_sub(from))?;
        match &self.inner {
            StoreInner::Mmap(mmap) => {
                for piece in mmap[from as usize..to as usize].chunks(chunk.max(1)) {
                    f(piece);
                }
            }
            StoreInner::File(_) => {
                let mut buf = vec![0u8; chunk.max(1)];
                let mut pos = from;
                while pos < to {
                    let n = ((to - pos) as usize).min(buf.len());
                    self.read_into(pos, &mut buf[..n])?;
                    f(&buf[..n]);
                    pos += n as u64;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ByteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStore")
            .field("path", &self.path)
            .field("size", &self.size())
            .field("writable", &self.writable)
            .field("mmap", &self.is_mmap())
            .finish()
    }
}
