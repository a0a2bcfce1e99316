//! Data blocks: the generic block header and the closed set of block kinds.
//!
//! Generic header (integers in the file byte order):
//! ```text
//! block id            u64 length + UTF-8
//! block semantics     u64
//! compression scheme  u64
//! offset to next      u64  (from the start of this block, 0 = last)
//! ```
//! The semantics tag selects the specialised body parser. Anything this
//! reader does not understand, or fails to parse, is kept as an
//! [`OpaqueBlock`] and written back byte for byte.

use std::sync::Arc;

use super::format::{BlockSemantic, CompressionScheme, IO_CHUNK_SIZE};
use super::histogram::{Histogram1DDataBlock, Histogram2DDataBlock};
use super::raster::{RasterDataBlock, WritePayload};
use crate::store::{ByteBuf, ByteStore, Endian, OStream, StoreCursor};
use crate::util::{Error, Result};

/// Generic header fields shared by every block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub id: String,
    pub semantic: BlockSemantic,
    pub compression: CompressionScheme,
    /// Offset to the next block as read from disk; recomputed on write.
    pub offset_to_next: u64,
}

impl BlockHeader {
    pub(crate) fn read(cursor: &mut StoreCursor<'_>) -> Result<Self> {
        let id = cursor.read_string()?;
        let semantic = BlockSemantic::from_tag(cursor.read_u64()?);
        let compression = CompressionScheme::from_tag(cursor.read_u64()?);
        let offset_to_next = cursor.read_u64()?;
        Ok(Self { id, semantic, compression, offset_to_next })
    }

    fn encode(&self, endian: Endian) -> Vec<u8> {
        let mut buf = ByteBuf::new(endian);
        buf.put_str(&self.id);
        buf.put_u64(self.semantic.tag());
        buf.put_u64(self.compression.tag());
        buf.put_u64(self.offset_to_next);
        buf.into_inner()
    }

    /// Encoded size of a generic header with this id.
    #[inline]
    fn encoded_len(id: &str) -> u64 {
        8 + id.len() as u64 + 8 + 8 + 8
    }
}

/// Ordered string pairs (dataset metadata).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValuePairDataBlock {
    pub id: String,
    pairs: Vec<(String, String)>,
}

impl KeyValuePairDataBlock {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), pairs: Vec::new() }
    }

    /// Append a pair. Keys are not required to be unique.
    pub fn add_pair(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Metadata block stamped with the writing library version.
    pub fn with_writer_info(id: impl Into<String>) -> Self {
        let mut block = Self::new(id);
        block.add_pair("writer", writer_version());
        block
    }

    pub(crate) fn parse(cursor: &mut StoreCursor<'_>, id: String) -> Result<Self> {
        let count = cursor.read_u64()?;
        // every pair needs at least two length prefixes
        if count.saturating_mul(16) > cursor.remaining() {
            return Err(Error::invalid(format!("{} key/value pairs exceed the file", count)));
        }
        let pairs = (0..count)
            .map(|_| Ok((cursor.read_string()?, cursor.read_string()?)))
            .collect::<Result<_>>()?;
        Ok(Self { id, pairs })
    }

    pub(crate) fn encode(&self, endian: Endian) -> Vec<u8> {
        let mut buf = ByteBuf::new(endian);
        buf.put_u64(self.pairs.len() as u64);
        for (k, v) in &self.pairs {
            buf.put_str(k);
            buf.put_str(v);
        }
        buf.into_inner()
    }
}

/// Library version string, e.g. `uvf 0.1.0 (built Oct 19 2026 12:00:00)`.
pub fn writer_version() -> String {
    let date = option_env!("UVF_BUILD_DATE").unwrap_or("unknown");
    let time = option_env!("UVF_BUILD_TIME").unwrap_or("unknown");
    format!("uvf {} (built {} {})", env!("CARGO_PKG_VERSION"), date, time)
}

/// Block kept verbatim: unknown semantics, or a body that failed to parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueBlock {
    pub id: String,
    pub semantic: BlockSemantic,
    pub compression: CompressionScheme,
    /// Everything after the generic header up to the next block.
    pub data: Vec<u8>,
}

impl OpaqueBlock {
    pub fn new(id: impl Into<String>, semantic: BlockSemantic, data: Vec<u8>) -> Self {
        Self { id: id.into(), semantic, compression: CompressionScheme::None, data }
    }
}

/// One data block of a container.
#[derive(Clone, Debug)]
pub enum Block {
    Raster(RasterDataBlock),
    Histogram1D(Histogram1DDataBlock),
    Histogram2D(Histogram2DDataBlock),
    KeyValue(KeyValuePairDataBlock),
    Opaque(OpaqueBlock),
}

impl Block {
    pub fn id(&self) -> &str {
        match self {
            Self::Raster(b) => &b.id,
            Self::Histogram1D(b) => &b.id,
            Self::Histogram2D(b) => &b.id,
            Self::KeyValue(b) => &b.id,
            Self::Opaque(b) => &b.id,
        }
    }

    pub fn semantic(&self) -> BlockSemantic {
        match self {
            Self::Raster(_) => BlockSemantic::RegularNDimGrid,
            Self::Histogram1D(_) => BlockSemantic::Histogram1D,
            Self::Histogram2D(_) => BlockSemantic::Histogram2D,
            Self::KeyValue(_) => BlockSemantic::KeyValuePairs,
            Self::Opaque(b) => b.semantic,
        }
    }

    pub fn compression(&self) -> CompressionScheme {
        match self {
            Self::Raster(b) => b.compression,
            Self::Opaque(b) => b.compression,
            _ => CompressionScheme::None,
        }
    }

    pub fn as_raster(&self) -> Option<&RasterDataBlock> {
        match self {
            Self::Raster(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_raster_mut(&mut self) -> Option<&mut RasterDataBlock> {
        match self {
            Self::Raster(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_histogram_1d(&self) -> Option<&Histogram1DDataBlock> {
        match self {
            Self::Histogram1D(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_histogram_2d(&self) -> Option<&Histogram2DDataBlock> {
        match self {
            Self::Histogram2D(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_key_value(&self) -> Option<&KeyValuePairDataBlock> {
        match self {
            Self::KeyValue(b) => Some(b),
            _ => None,
        }
    }

    /// Internal consistency check run before a block joins a container.
    pub fn verify(&self) -> Result<()> {
        if self.id().len() as u64 > u32::MAX as u64 {
            return Err(Error::validation("block id too long"));
        }
        match self {
            Self::Raster(b) => b.verify(),
            Self::Histogram2D(b) => b.verify(),
            Self::Histogram1D(_) | Self::KeyValue(_) | Self::Opaque(_) => Ok(()),
        }
    }

    /// Parse the block starting at `pos`. Returns the block and its header.
    ///
    /// Specialised bodies that fail to parse degrade to [`OpaqueBlock`].
    pub(crate) fn parse(store: &Arc<ByteStore>, pos: u64, endian: Endian) -> Result<(Self, BlockHeader)> {
        let mut cursor = StoreCursor::new(store, pos, endian);
        let header = BlockHeader::read(&mut cursor)?;
        let body_start = cursor.pos();
        let header_len = body_start - pos;

        let end = if header.offset_to_next == 0 {
            store.size()
        } else {
            if header.offset_to_next < header_len {
                return Err(Error::invalid(format!(
                    "block '{}' at {} points {} bytes ahead, inside its own header",
                    header.id, pos, header.offset_to_next
                )));
            }
            pos.checked_add(header.offset_to_next)
                .filter(|&end| end <= store.size())
                .ok_or_else(|| {
                    Error::invalid(format!(
                        "block '{}' at {} points past the end of the file",
                        header.id, pos
                    ))
                })?
        };

        let specialised = match (header.semantic, header.compression) {
            (BlockSemantic::RegularNDimGrid, compression) => Some(
                RasterDataBlock::parse(&mut cursor, store, header.id.clone(), compression, end)
                    .map(Self::Raster),
            ),
            (BlockSemantic::Histogram1D, CompressionScheme::None) => {
                Some(Histogram1DDataBlock::parse(&mut cursor, header.id.clone()).map(Self::Histogram1D))
            }
            (BlockSemantic::Histogram2D, CompressionScheme::None) => {
                Some(Histogram2DDataBlock::parse(&mut cursor, header.id.clone()).map(Self::Histogram2D))
            }
            (BlockSemantic::KeyValuePairs, CompressionScheme::None) => {
                Some(KeyValuePairDataBlock::parse(&mut cursor, header.id.clone()).map(Self::KeyValue))
            }
            _ => None,
        };

        let block = match specialised {
            Some(Ok(block)) if cursor.pos() <= end => block,
            Some(Ok(_)) => {
                tracing::warn!(id = %header.id, "block body overruns its extent, keeping it opaque");
                Self::opaque_from(store, &header, body_start, end)?
            }
            Some(Err(e)) => {
                tracing::warn!(id = %header.id, semantic = %header.semantic, error = %e, "malformed block kept opaque");
                Self::opaque_from(store, &header, body_start, end)?
            }
            None => {
                tracing::debug!(id = %header.id, semantic = %header.semantic, "keeping block opaque");
                Self::opaque_from(store, &header, body_start, end)?
            }
        };
        Ok((block, header))
    }

    fn opaque_from(store: &ByteStore, header: &BlockHeader, start: u64, end: u64) -> Result<Self> {
        let data = store.read_at(start, (end - start) as usize)?;
        Ok(Self::Opaque(OpaqueBlock {
            id: header.id.clone(),
            semantic: header.semantic,
            compression: header.compression,
            data,
        }))
    }

    /// Write this block at the stream position. `offset_to_next` is computed
    /// from the encoded size unless this is the last block.
    pub(crate) fn write(&self, out: &mut OStream, is_last: bool) -> Result<()> {
        let endian = out.endian();
        let (body, payload) = match self {
            Self::Raster(b) => (b.encode_header(endian), Some(b.payload_for_write()?)),
            Self::Histogram1D(b) => (b.encode(endian), None),
            Self::Histogram2D(b) => (b.encode(endian), None),
            Self::KeyValue(b) => (b.encode(endian), None),
            Self::Opaque(b) => (b.data.clone(), None),
        };
        let payload_len = payload.as_ref().map_or(0, WritePayload::len);
        let total = BlockHeader::encoded_len(self.id()) + body.len() as u64 + payload_len;

        let header = BlockHeader {
            id: self.id().to_string(),
            semantic: self.semantic(),
            compression: self.compression(),
            offset_to_next: if is_last { 0 } else { total },
        };
        out.write_bytes(&header.encode(endian))?;
        out.write_bytes(&body)?;
        match payload {
            None => {}
            Some(WritePayload::Bytes(bytes)) => out.write_bytes(&bytes)?,
            Some(WritePayload::Copy { store, offset, len }) => {
                let mut copy_err = None;
                store.for_each_chunk(offset, offset + len, IO_CHUNK_SIZE, |chunk| {
                    if copy_err.is_none() {
                        if let Err(e) = out.write_bytes(chunk) {
                            copy_err = Some(e);
                        }
                    }
                })?;
                if let Some(e) = copy_err {
                    return Err(e);
                }
            }
        }
        tracing::debug!(id = %self.id(), semantic = %self.semantic(), bytes = total, "wrote block");
        Ok(())
    }
}

impl From<RasterDataBlock> for Block {
    fn from(b: RasterDataBlock) -> Self {
        Self::Raster(b)
    }
}

impl From<Histogram1DDataBlock> for Block {
    fn from(b: Histogram1DDataBlock) -> Self {
        Self::Histogram1D(b)
    }
}

impl From<Histogram2DDataBlock> for Block {
    fn from(b: Histogram2DDataBlock) -> Self {
        Self::Histogram2D(b)
    }
}

impl From<KeyValuePairDataBlock> for Block {
    fn from(b: KeyValuePairDataBlock) -> Self {
        Self::KeyValue(b)
    }
}

impl From<OpaqueBlock> for Block {
    fn from(b: OpaqueBlock) -> Self {
        Self::Opaque(b)
    }
}
