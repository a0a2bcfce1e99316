//! UVF global header.
//!
//! Layout after the 8 magic bytes (integers in the declared byte order):
//! ```text
//! endian flag        u8   (0 little, 1 big)
//! file version       u64
//! checksum scheme    u64
//! checksum length    u64
//! checksum bytes     [u8; length]
//! offset to block 0  u64  (from the end of the header)
//! additional header  u64  (reserved size, 0 when written here)
//! ```

use super::format::{ChecksumScheme, CHECKSUM_OFFSET, UVF_MAGIC, UVF_VERSION};
use crate::store::{ByteBuf, ByteStore, Endian, StoreCursor};
use crate::util::{Error, Result};

/// File-level metadata. Immutable once a container holds it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalHeader {
    pub endian: Endian,
    pub version: u64,
    pub checksum_scheme: ChecksumScheme,
    pub checksum: Vec<u8>,
    pub offset_to_first_block: u64,
    pub additional_header_size: u64,
}

impl Default for GlobalHeader {
    fn default() -> Self {
        Self::new(ChecksumScheme::None, Endian::native())
    }
}

impl GlobalHeader {
    /// Canonical header for writing: writer version, zero offsets and a
    /// zeroed checksum of the scheme's length.
    pub fn new(checksum_scheme: ChecksumScheme, endian: Endian) -> Self {
        Self {
            endian,
            version: UVF_VERSION,
            checksum_scheme,
            checksum: Vec::new(),
            offset_to_first_block: 0,
            additional_header_size: 0,
        }
        .canonical()
    }

    /// Normalise the fields a writer controls. Unknown schemes fall back to none.
    pub fn canonical(mut self) -> Self {
        let len = match self.checksum_scheme.digest_len() {
            Some(len) => len,
            None => {
                tracing::warn!(scheme = %self.checksum_scheme, "unknown checksum scheme, writing without checksum");
                self.checksum_scheme = ChecksumScheme::None;
                0
            }
        };
        self.version = UVF_VERSION;
        self.offset_to_first_block = 0;
        self.additional_header_size = 0;
        self.checksum = vec![0u8; len];
        self
    }

    /// Offset of the checksum bytes.
    #[inline]
    pub const fn checksum_offset(&self) -> u64 {
        CHECKSUM_OFFSET
    }

    /// First byte covered by the checksum.
    #[inline]
    pub fn checksum_end(&self) -> u64 {
        CHECKSUM_OFFSET + self.checksum.len() as u64
    }

    /// Size of magic plus header.
    #[inline]
    pub fn encoded_len(&self) -> u64 {
        self.checksum_end() + 16
    }

    /// Absolute offset of the first data block.
    #[inline]
    pub fn first_block_offset(&self) -> u64 {
        self.encoded_len() + self.offset_to_first_block
    }

    /// Parse magic and header from the start of a store.
    pub fn read(store: &ByteStore) -> Result<Self> {
        let magic = store.read_at(0, UVF_MAGIC.len())?;
        if magic.as_slice() != UVF_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let flag = store.read_u8(8)?;
        let endian = Endian::from_flag(flag)
            .ok_or_else(|| Error::invalid(format!("invalid endianness flag {}", flag)))?;

        let mut cursor = StoreCursor::new(store, 9, endian);
        let version = cursor.read_u64()?;
        if version > UVF_VERSION {
            return Err(Error::UnsupportedVersion { found: version, supported: UVF_VERSION });
        }

        let checksum_scheme = ChecksumScheme::from_tag(cursor.read_u64()?);
        let checksum_len = cursor.read_u64()?;
        if let Some(expected) = checksum_scheme.digest_len() {
            if checksum_len != expected as u64 {
                return Err(Error::ChecksumLengthMismatch {
                    stored: checksum_len as usize,
                    computed: expected,
                });
            }
        }
        let checksum = cursor.read_bytes(checksum_len)?;
        let offset_to_first_block = cursor.read_u64()?;
        let additional_header_size = cursor.read_u64()?;

        Ok(Self {
            endian,
            version,
            checksum_scheme,
            checksum,
            offset_to_first_block,
            additional_header_size,
        })
    }

    /// Encode magic plus header.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = ByteBuf::new(self.endian);
        buf.put_bytes(UVF_MAGIC);
        buf.put_u8(self.endian.flag());
        buf.put_u64(self.version);
        buf.put_u64(self.checksum_scheme.tag());
        buf.put_u64(self.checksum.len() as u64);
        buf.put_bytes(&self.checksum);
        buf.put_u64(self.offset_to_first_block);
        buf.put_u64(self.additional_header_size);
        buf.into_inner()
    }
}
