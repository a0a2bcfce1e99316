//! Whole-file checksums (CRC32 and MD5).
//!
//! Both digests cover every byte from the end of the header's checksum field
//! to the end of the file, streamed in 1 MiB chunks.

use md5::{Digest, Md5};

use super::format::{ChecksumScheme, IO_CHUNK_SIZE};
use super::header::GlobalHeader;
use crate::store::ByteStore;
use crate::util::{Error, Result};

/// Compute the digest of `[from, EOF)` with the given scheme.
///
/// CRC32 is the standard reflected CRC-32 (initial value and final XOR
/// 0xFFFFFFFF), stored as its four little-endian bytes.
pub fn compute(scheme: ChecksumScheme, store: &ByteStore, from: u64) -> Result<Vec<u8>> {
    let to = store.size();
    match scheme {
        ChecksumScheme::None => Ok(Vec::new()),
        ChecksumScheme::Crc32 => {
            let mut hasher = crc32fast::Hasher::new();
            store.for_each_chunk(from, to, IO_CHUNK_SIZE, |chunk| hasher.update(chunk))?;
            Ok(hasher.finalize().to_le_bytes().to_vec())
        }
        ChecksumScheme::Md5 => {
            let mut hasher = Md5::new();
            store.for_each_chunk(from, to, IO_CHUNK_SIZE, |chunk| hasher.update(chunk))?;
            Ok(hasher.finalize().to_vec())
        }
        ChecksumScheme::Unknown(tag) => {
            Err(Error::unsupported(format!("checksum scheme {}", tag)))
        }
    }
}

/// Recompute the checksum for `header` and compare with the stored bytes.
///
/// A scheme of "none" always verifies. Length and value mismatches are
/// reported as different errors.
pub fn verify(header: &GlobalHeader, store: &ByteStore) -> Result<()> {
    if header.checksum_scheme == ChecksumScheme::None {
        return Ok(());
    }
    let computed = compute(header.checksum_scheme, store, header.checksum_end())?;
    if computed.len() != header.checksum.len() {
        return Err(Error::ChecksumLengthMismatch {
            stored: header.checksum.len(),
            computed: computed.len(),
        });
    }
    if computed != header.checksum {
        return Err(Error::ChecksumMismatch {
            stored: to_hex(&header.checksum),
            computed: to_hex(&computed),
        });
    }
    tracing::debug!(scheme = %header.checksum_scheme, "checksum verified");
    Ok(())
}

/// Lowercase hex rendering of a digest.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
