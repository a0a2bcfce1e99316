//! Sequential decoding on top of a [`ByteStore`].

use super::byte_store::ByteStore;
use super::endian::Endian;
use crate::util::{Error, Result};

/// Largest string accepted in a block header.
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

/// Forward-only reader that tracks its position in a store.
#[derive(Debug)]
pub struct StoreCursor<'a> {
    store: &'a ByteStore,
    pos: u64,
    endian: Endian,
}

impl<'a> StoreCursor<'a> {
    pub fn new(store: &'a ByteStore, pos: u64, endian: Endian) -> Self {
        Self { store, pos, endian }
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Bytes left before end of file.
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.store.size().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let v = self.store.read_u8(self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let v = self.store.read_u64(self.pos, self.endian)?;
        self.pos += 8;
        Ok(v)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let v = self.store.read_f64(self.pos, self.endian)?;
        self.pos += 8;
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>> {
        if len > self.remaining() {
            return Err(Error::invalid(format!(
                "{} bytes requested at offset {}, only {} remain",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let data = self.store.read_at(self.pos, len as usize)?;
        self.pos += len;
        Ok(data)
    }

    /// Read `count` u64 values, rejecting counts the file cannot hold.
    pub fn read_u64_array(&mut self, count: u64) -> Result<Vec<u64>> {
        if count.saturating_mul(8) > self.remaining() {
            return Err(Error::invalid(format!("vector of {} entries exceeds file size", count)));
        }
        (0..count).map(|_| self.read_u64()).collect()
    }

    /// Read a length-prefixed u64 vector.
    pub fn read_u64_vec(&mut self) -> Result<Vec<u64>> {
        let count = self.read_u64()?;
        self.read_u64_array(count)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u64()?;
        if len > MAX_STRING_LEN {
            return Err(Error::invalid(format!("string of {} bytes at offset {}", len, self.pos)));
        }
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| Error::invalid(format!("invalid UTF-8: {}", e)))
    }
}
