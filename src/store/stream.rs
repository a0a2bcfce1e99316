//! Buffered output stream used when a container is written.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use super::endian::Endian;
use crate::util::Result;

/// Output stream for writing a container file front to back.
pub struct OStream {
    writer: BufWriter<File>,
    pos: u64,
    endian: Endian,
}

impl OStream {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: impl AsRef<Path>, endian: Endian) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            writer: BufWriter::with_capacity(2 * 1024 * 1024, file), // 2MB buffer
            pos: 0,
            endian,
        })
    }

    /// Get the current write position.
    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Write bytes and advance position.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    /// Flush the buffer and sync to disk.
    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
