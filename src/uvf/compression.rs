//! Block payload compression.
//!
//! Compressed payloads are framed as `[raw length: u64 LE][zlib stream]`.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::format::CompressionScheme;
use crate::util::{Error, Result};

/// Compress `data` with `scheme`, adding the length frame for zlib.
pub fn compress(scheme: CompressionScheme, data: &[u8]) -> Result<Vec<u8>> {
    match scheme {
        CompressionScheme::None => Ok(data.to_vec()),
        CompressionScheme::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            let compressed = encoder.finish()?;

            let mut result = Vec::with_capacity(8 + compressed.len());
            result.extend_from_slice(&(data.len() as u64).to_le_bytes());
            result.extend_from_slice(&compressed);
            Ok(result)
        }
        CompressionScheme::Unknown(tag) => {
            Err(Error::unsupported(format!("compression scheme {}", tag)))
        }
    }
}

/// Undo [`compress`]. The inflated length must match the frame.
pub fn decompress(scheme: CompressionScheme, data: &[u8]) -> Result<Vec<u8>> {
    match scheme {
        CompressionScheme::None => Ok(data.to_vec()),
        CompressionScheme::Zlib => {
            if data.len() < 8 {
                return Err(Error::Compression("zlib frame shorter than its length prefix".into()));
            }
            let mut size = [0u8; 8];
            size.copy_from_slice(&data[..8]);
            let expected = u64::from_le_bytes(size);

            let mut decoder = ZlibDecoder::new(&data[8..]);
            let mut out = Vec::with_capacity(expected.min(1 << 30) as usize);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::Compression(e.to_string()))?;

            if out.len() as u64 != expected {
                return Err(Error::Compression(format!(
                    "inflated {} bytes, frame declares {}",
                    out.len(),
                    expected
                )));
            }
            Ok(out)
        }
        CompressionScheme::Unknown(tag) => {
            Err(Error::unsupported(format!("compression scheme {}", tag)))
        }
    }
}
