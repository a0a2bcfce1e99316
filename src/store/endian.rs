//! File-wide byte order.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Byte order declared by a container's global header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Byte order of the running machine.
    #[inline]
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// Header flag value (0 little, 1 big).
    #[inline]
    pub const fn flag(self) -> u8 {
        match self {
            Self::Little => 0,
            Self::Big => 1,
        }
    }

    #[inline]
    pub const fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Self::Little),
            1 => Some(Self::Big),
            _ => None,
        }
    }

    #[inline]
    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Self::Little => LittleEndian::read_u64(buf),
            Self::Big => BigEndian::read_u64(buf),
        }
    }

    #[inline]
    pub fn read_f64(self, buf: &[u8]) -> f64 {
        match self {
            Self::Little => LittleEndian::read_f64(buf),
            Self::Big => BigEndian::read_f64(buf),
        }
    }

    #[inline]
    pub fn u64_bytes(self, value: u64) -> [u8; 8] {
        let mut buf = [0u8; 8];
        match self {
            Self::Little => LittleEndian::write_u64(&mut buf, value),
            Self::Big => BigEndian::write_u64(&mut buf, value),
        }
        buf
    }

    #[inline]
    pub fn f64_bytes(self, value: f64) -> [u8; 8] {
        let mut buf = [0u8; 8];
        match self {
            Self::Little => LittleEndian::write_f64(&mut buf, value),
            Self::Big => BigEndian::write_f64(&mut buf, value),
        }
        buf
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Little => "little endian",
            Self::Big => "big endian",
        }
    }
}

/// Growable byte buffer that encodes integers in a fixed byte order.
///
/// Block headers are assembled here first so their length is known before
/// the "offset to next" field is written.
#[derive(Debug, Clone, Default)]
pub struct ByteBuf {
    buf: Vec<u8>,
    endian: Endian,
}

impl ByteBuf {
    pub fn new(endian: Endian) -> Self {
        Self { buf: Vec::new(), endian }
    }

    #[inline]
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    #[inline]
    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    #[inline]
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&self.endian.u64_bytes(value));
    }

    #[inline]
    pub fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&self.endian.f64_bytes(value));
    }

    /// Length-prefixed vector of u64 values.
    pub fn put_u64_vec(&mut self, values: &[u64]) {
        self.put_u64(values.len() as u64);
        for &v in values {
            self.put_u64(v);
        }
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) {
        self.put_u64(value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
    }

    #[inline]
    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
